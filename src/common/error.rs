//! Error types for dynconf

use crate::coordinator::failures::NodeFailure;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // === Storage Errors ===
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Change log error: {0}")]
    ChangeLog(String),

    // === Topology Errors ===
    #[error("Invalid change: {0}")]
    InvalidChange(String),

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    // === Orchestration Errors ===
    #[error("Change already in progress on {0}")]
    ChangeInProgress(String),

    #[error("Nodes not reachable: {0}")]
    NodesUnreachable(String),

    #[error("Prepare failed on {node}: {reason}")]
    PrepareFailed { node: String, reason: String },

    #[error("Change {uuid} partially committed, repair required: {failures:?}")]
    PartialCommit {
        uuid: uuid::Uuid,
        failures: Vec<NodeFailure>,
    },

    #[error("Cluster is not consistent: {0}")]
    Inconsistent(String),

    #[error("Unrecoverable configuration divergence: {0}")]
    Unrecoverable(String),

    #[error("{} node(s) failed: {}", .0.len(), crate::coordinator::failures::describe(.0))]
    Aggregate(Vec<NodeFailure>),

    #[error("Nodes did not reach {target} within {waited_secs}s: {missing:?}")]
    RestartTimeout {
        target: String,
        waited_secs: u64,
        missing: Vec<String>,
    },

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::NodesUnreachable(_)
                | Error::PrepareFailed { .. }
        )
    }

    /// Does the cluster need a repair pass after this error?
    pub fn needs_repair(&self) -> bool {
        matches!(self, Error::PartialCommit { .. })
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidConfig(_) | Error::InvalidChange(_) | Error::InvalidTopology(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::ChangeInProgress(_) | Error::Inconsistent(_) => StatusCode::CONFLICT,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::NodesUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout("discover".into()).is_retryable());
        assert!(Error::NodesUnreachable("node-1".into()).is_retryable());
        assert!(!Error::Unrecoverable("split history".into()).is_retryable());
    }

    #[test]
    fn test_http_status() {
        assert_eq!(
            Error::ChangeInProgress("node-1".into()).to_http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::InvalidChange("bad".into()).to_http_status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_partial_commit_needs_repair() {
        let err = Error::PartialCommit {
            uuid: uuid::Uuid::new_v4(),
            failures: Vec::new(),
        };
        assert!(err.needs_repair());
        assert!(!Error::Other("x".into()).needs_repair());
    }
}
