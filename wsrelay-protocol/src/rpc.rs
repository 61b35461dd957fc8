//! RPC envelope types.

use crate::error::RpcErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// An RPC envelope: either a request or its correlated response.
///
/// Internally tagged on the wire:
/// `{"type":"request","call_id":...,"method":...,"args":[...],"kwargs":{...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Rpc {
    Request(RpcRequest),
    Response(RpcResponse),
}

/// A client-initiated call. `call_id` links the request to its unique
/// response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub call_id: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl RpcRequest {
    /// Creates a request with a fresh call id and no arguments.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            call_id: Uuid::new_v4().to_string(),
            method: method.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }
}

/// The server's answer to a request. `response` carries the handler's
/// return value verbatim, null included; `error` is set only on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub call_id: String,
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub error: Option<RpcErrorCode>,
}

impl RpcResponse {
    /// Creates a successful response.
    pub fn ok(call_id: impl Into<String>, response: Value) -> Self {
        Self {
            call_id: call_id.into(),
            response,
            error: None,
        }
    }

    /// Creates an error response. `message` lands in the `response` field
    /// so clients get a human-readable reason next to the stable code.
    pub fn err(call_id: impl Into<String>, code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            response: Value::String(message.into()),
            error: Some(code),
        }
    }

    /// Returns whether this response reports an error.
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}
