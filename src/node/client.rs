//! reqwest client for the node HTTP surface

use crate::common::utils::retry_with_backoff;
use crate::common::{Error, LogicalServerState, Result};
use crate::coordinator::client::{CallError, CallResult, LogicalStateProbe, NodeAddress, NodeClient};
use crate::protocol::{
    AcceptRejectBody, AcceptRejectResponse, CommitMessage, DiscoverResponse, ForceStateMessage,
    PrepareMessage, RollbackMessage, TopologyView,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Read-only calls are retried this many times on connection errors
const DISCOVER_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct HttpNodeClient {
    http: reqwest::Client,
}

impl HttpNodeClient {
    /// `request_timeout` bounds every HTTP exchange
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self { http })
    }

    fn url(node: &NodeAddress, path: &str) -> String {
        format!("http://{}{}", node, path)
    }

    async fn get<T: DeserializeOwned>(&self, node: &NodeAddress, path: &str) -> Result<T> {
        let response = self
            .http
            .get(Self::url(node, path))
            .send()
            .await
            .map_err(map_reqwest)?;
        decode(response).await
    }

    /// GET, retried with backoff while the node is not reachable
    async fn get_with_retry<T: DeserializeOwned>(
        &self,
        node: &NodeAddress,
        path: &str,
    ) -> CallResult<T> {
        retry_with_backoff(|| self.get(node, path), DISCOVER_ATTEMPTS, RETRY_DELAY)
            .await
            .map_err(to_call_error)
    }

    async fn post<M: Serialize + Sync>(
        &self,
        node: &NodeAddress,
        path: &str,
        message: &M,
    ) -> CallResult<()> {
        let response = self
            .http
            .post(Self::url(node, path))
            .json(message)
            .send()
            .await
            .map_err(|e| to_call_error(map_reqwest(e)))?;
        let body: AcceptRejectBody = decode(response).await.map_err(to_call_error)?;
        AcceptRejectResponse::from(body).map_err(CallError::Rejected)
    }
}

fn map_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else if e.is_connect() {
        Error::ConnectionFailed(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(Error::Http(format!("HTTP {}: {}", status, text)));
    }
    response.json::<T>().await.map_err(map_reqwest)
}

fn to_call_error(e: Error) -> CallError {
    match e {
        Error::Timeout(_) => CallError::Timeout,
        other => CallError::Unreachable(other.to_string()),
    }
}

#[derive(Deserialize)]
struct StateBody {
    state: LogicalServerState,
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn discover(&self, node: &NodeAddress) -> CallResult<DiscoverResponse> {
        self.get_with_retry(node, "/nomad/discover").await
    }

    async fn prepare(&self, node: &NodeAddress, message: &PrepareMessage) -> CallResult<()> {
        self.post(node, "/nomad/prepare", message).await
    }

    async fn commit(&self, node: &NodeAddress, message: &CommitMessage) -> CallResult<()> {
        self.post(node, "/nomad/commit", message).await
    }

    async fn rollback(&self, node: &NodeAddress, message: &RollbackMessage) -> CallResult<()> {
        self.post(node, "/nomad/rollback", message).await
    }

    async fn force_state(
        &self,
        node: &NodeAddress,
        message: &ForceStateMessage,
    ) -> CallResult<()> {
        self.post(node, "/nomad/force", message).await
    }

    async fn topology(&self, node: &NodeAddress) -> CallResult<TopologyView> {
        self.get_with_retry(node, "/topology").await
    }
}

#[async_trait]
impl LogicalStateProbe for HttpNodeClient {
    async fn logical_state(&self, node: &NodeAddress) -> LogicalServerState {
        match self.get::<StateBody>(node, "/state").await {
            Ok(body) => body.state,
            Err(e) => {
                tracing::debug!("{} did not report its state: {}", node, e);
                LogicalServerState::Unreachable
            }
        }
    }
}
