//! Error types for consul-coord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Backend Errors ===
    /// Transport failure or non-success status from the coordination backend.
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to decode backend response: {0}")]
    Decode(#[from] serde_json::Error),

    // === Coordination Errors ===
    /// The critical section run under `lock` faulted. The lock was released
    /// and its session destroyed before this was returned.
    #[error("Critical section under lock '{lock}' failed: {source}")]
    LockCallbackFailed {
        lock: String,
        #[source]
        source: Box<Error>,
    },

    // === Allocation Errors ===
    #[error("Allocation infeasible: {0}")]
    AllocationInfeasible(String),

    #[error("Invalid allocation spec: {0}")]
    InvalidSpec(String),

    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Config Errors ===
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Only the caller layer retries; the coordination primitives surface
    /// these errors as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RequestFailed(_) => true,
            Error::LockCallbackFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        // A round trip past its bound is a failed request like any other.
        if e.is_timeout() {
            return Error::RequestFailed(format!("timed out: {}", e));
        }
        Error::RequestFailed(e.to_string())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::RequestFailed("500 on /v1/kv/x".into()).is_retryable());
        assert!(!Error::InvalidSpec("empty".into()).is_retryable());
        assert!(!Error::InvalidConfig("consul.wait_ms must be positive".into()).is_retryable());
    }

    #[test]
    fn test_callback_failure_looks_through_source() {
        let err = Error::LockCallbackFailed {
            lock: "web/shutdown".into(),
            source: Box::new(Error::RequestFailed("503 on /v1/health/node/a".into())),
        };
        assert!(err.is_retryable());

        let err = Error::LockCallbackFailed {
            lock: "web/shutdown".into(),
            source: Box::new(Error::Other("boom".into())),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("web/shutdown"));
    }
}
