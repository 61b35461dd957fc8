//! Client error types.

use thiserror::Error;
use wsrelay_protocol::ProtocolError;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("all connection attempts failed after {0} retries")]
    ConnectionFailed(u32),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("RPC call timed out")]
    RpcTimeout,

    #[error("receive timed out")]
    RecvTimeout,

    #[error("RPC call was rate limited")]
    RateLimited,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

impl ClientError {
    /// Returns whether the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::ConnectTimeout
                | ClientError::RpcTimeout
                | ClientError::ConnectionClosed
                | ClientError::RateLimited
        )
    }
}
