//! Server error types.

use thiserror::Error;
use wsrelay_protocol::ProtocolError;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC method already registered: {0}")]
    DuplicateRpcMethod(String),

    #[error("invalid rate-limit period: {0}")]
    InvalidPeriod(String),

    #[error("packet error: {0}")]
    Packet(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("receive timed out")]
    RecvTimeout,

    #[error("server is not running")]
    NotRunning,

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server shutting down")]
    ShuttingDown,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}
