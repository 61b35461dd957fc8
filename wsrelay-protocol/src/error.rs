//! Protocol error types and RPC error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur while encoding or decoding packets.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'WSRL', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported binary codec version: {0}")]
    UnsupportedVersion(u16),

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("invalid section bitmap: {0:#x}")]
    InvalidSections(u8),

    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("truncated packet: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("unknown packet source: {0}")]
    InvalidSource(u8),

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("unexpected {0} frame for the configured wire format")]
    UnexpectedFrame(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stable RPC error codes carried inside response envelopes.
///
/// These codes are part of the wire contract and must remain stable
/// across versions. They are reported inline in responses, never raised
/// as transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorCode {
    MethodNotFound,
    AccessDenied,
    RateLimited,
    InvalidArguments,
    InternalError,
}

impl RpcErrorCode {
    /// Returns whether a call failing with this code may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcErrorCode::RateLimited | RpcErrorCode::InternalError)
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcErrorCode::MethodNotFound => write!(f, "METHOD_NOT_FOUND"),
            RpcErrorCode::AccessDenied => write!(f, "ACCESS_DENIED"),
            RpcErrorCode::RateLimited => write!(f, "RATE_LIMITED"),
            RpcErrorCode::InvalidArguments => write!(f, "INVALID_ARGUMENTS"),
            RpcErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}
