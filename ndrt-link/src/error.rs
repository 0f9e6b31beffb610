//! Transport errors, one enum per channel operation.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid endpoint `{0}` (expected tcp://host:port or ipc://path)")]
    InvalidEndpoint(String),
    #[error("address already in use: {0}")]
    AddressInUse(String),
    #[error("bind {endpoint} failed: {reason}")]
    BindFailed { endpoint: String, reason: String },
    #[error("{endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },
    #[error("pupil remote discovery via {remote} failed: {reason}")]
    Discovery { remote: String, reason: String },
    #[error("runtime: {0}")]
    Runtime(#[from] std::io::Error),
    /// A previous attempt failed and the retry delay has not passed yet.
    #[error("connect deferred for another {retry_in_ms}ms after: {last_error}")]
    Backoff { retry_in_ms: u64, last_error: String },
    /// Closed explicitly; only a reconnect reopens it.
    #[error("channel closed")]
    Closed,
}

impl ConnectError {
    pub(crate) fn timed_out(endpoint: &str, after: Duration) -> Self {
        ConnectError::Unreachable {
            endpoint: endpoint.to_string(),
            reason: format!("no connection within {}ms", after.as_millis()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error("channel not connected")]
    NotConnected,
    #[error("expected topic and payload frames, got {frames} frame(s)")]
    Truncated { frames: usize },
    #[error("receive failed: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("channel has no publisher")]
    NotConnected,
    #[error("send did not complete within {0}ms")]
    Timeout(u64),
    #[error("send failed: {0}")]
    Transport(String),
}
