//! Utility functions for dynconf

use serde::{Deserialize, Serialize};

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else {
        let split = s.len() - s.chars().last().map(char::len_utf8).unwrap_or(0);
        (&s[..split], &s[split..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => std::time::Duration::from_millis(num),
        "s" => std::time::Duration::from_secs(num),
        "m" => std::time::Duration::from_secs(num * 60),
        "h" => std::time::Duration::from_secs(num * 3600),
        "d" => std::time::Duration::from_secs(num * 86400),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Host name recorded as mutation provenance
pub fn local_host() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// User name recorded as mutation provenance
pub fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Externally observed liveness/role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogicalServerState {
    Starting,
    Active,
    Passive,
    Unreachable,
    Unknown,
}

impl LogicalServerState {
    pub fn is_active(&self) -> bool {
        matches!(self, LogicalServerState::Active)
    }

    /// Can this node take part in a change?
    pub fn is_online(&self) -> bool {
        !matches!(
            self,
            LogicalServerState::Unreachable | LogicalServerState::Unknown
        )
    }
}

impl std::fmt::Display for LogicalServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogicalServerState::Starting => write!(f, "STARTING"),
            LogicalServerState::Active => write!(f, "ACTIVE"),
            LogicalServerState::Passive => write!(f, "PASSIVE"),
            LogicalServerState::Unreachable => write!(f, "UNREACHABLE"),
            LogicalServerState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl std::str::FromStr for LogicalServerState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STARTING" => Ok(LogicalServerState::Starting),
            "ACTIVE" => Ok(LogicalServerState::Active),
            "PASSIVE" => Ok(LogicalServerState::Passive),
            "UNREACHABLE" => Ok(LogicalServerState::Unreachable),
            "UNKNOWN" => Ok(LogicalServerState::Unknown),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown server state: {}",
                other
            ))),
        }
    }
}

/// Retry with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: std::time::Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries - 1 => {
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(
            parse_duration("500ms").unwrap(),
            std::time::Duration::from_millis(500)
        );
        assert_eq!(
            parse_duration("30s").unwrap(),
            std::time::Duration::from_secs(30)
        );
        assert_eq!(
            parse_duration("5m").unwrap(),
            std::time::Duration::from_secs(300)
        );
        assert_eq!(
            parse_duration("1h").unwrap(),
            std::time::Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_logical_server_state() {
        assert!(LogicalServerState::Active.is_online());
        assert!(LogicalServerState::Passive.is_online());
        assert!(!LogicalServerState::Unreachable.is_online());
        assert!(!LogicalServerState::Unknown.is_online());
        assert_eq!(
            "passive".parse::<LogicalServerState>().unwrap(),
            LogicalServerState::Passive
        );
        assert!("sleeping".parse::<LogicalServerState>().is_err());
    }

    #[test]
    fn test_crc32_stable() {
        assert_eq!(crc32(b"dynconf"), crc32(b"dynconf"));
        assert_ne!(crc32(b"dynconf"), crc32(b"dynconF"));
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_fatal_error() {
        let mut calls = 0;
        let res: crate::Result<()> = retry_with_backoff(
            || {
                calls += 1;
                async { Err(crate::Error::Unrecoverable("split".into())) }
            },
            3,
            std::time::Duration::from_millis(1),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(calls, 1);
    }
}
