//! RPC method registry and request dispatch.

use crate::connection::Connection;
use crate::error::ServerError;
use crate::predicate::Predicate;
use crate::ratelimit::RateLimit;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use wsrelay_protocol::{Packet, RpcErrorCode, RpcRequest, RpcResponse};

/// Errors an RPC handler can report. They map to stable wire codes and
/// never cross the wire as transport errors.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Internal(String),
}

impl RpcError {
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        RpcError::InvalidArguments(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        RpcError::Internal(message.into())
    }

    fn code(&self) -> RpcErrorCode {
        match self {
            RpcError::InvalidArguments(_) => RpcErrorCode::InvalidArguments,
            RpcError::Internal(_) => RpcErrorCode::InternalError,
        }
    }
}

/// Result of an RPC handler. The `Ok` value is carried verbatim in the
/// response, falsy values included.
pub type RpcResult = Result<Value, RpcError>;

type BoxedRpcFuture = Pin<Box<dyn Future<Output = RpcResult> + Send>>;

type RpcHandlerFn =
    Arc<dyn Fn(Arc<Connection>, Vec<Value>, Map<String, Value>) -> BoxedRpcFuture + Send + Sync>;

/// Access and throttling options attached to a method at registration.
#[derive(Default)]
pub struct MethodOptions {
    requires: Option<Predicate>,
    rate_limit: Option<RateLimit>,
}

impl MethodOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate the method behind a predicate over the caller's session bag.
    pub fn requires(mut self, predicate: Predicate) -> Self {
        self.requires = Some(predicate);
        self
    }

    /// Throttle the method with a per-connection token bucket.
    pub fn rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }
}

#[derive(Clone)]
struct RpcMethod {
    handler: RpcHandlerFn,
    requires: Option<Predicate>,
    rate_limit: Option<RateLimit>,
}

/// Method registry. Usually populated before the server starts, where a
/// duplicate alias is a fatal registration error; handler code can also
/// add methods at runtime through [`Connection::rpc_methods`].
pub struct RpcRegistry {
    methods: RwLock<HashMap<String, RpcMethod>>,
    semaphore: Arc<Semaphore>,
}

impl RpcRegistry {
    /// Creates a registry capping concurrently running handler tasks at
    /// `task_limit`.
    pub fn new(task_limit: usize) -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(task_limit.max(1))),
        }
    }

    /// Registers a handler under the given alias.
    pub fn register<F, Fut>(&self, alias: impl Into<String>, handler: F) -> Result<(), ServerError>
    where
        F: Fn(Arc<Connection>, Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult> + Send + 'static,
    {
        self.register_with(alias, handler, MethodOptions::default())
    }

    /// Registers a handler with access-control and rate-limit options.
    pub fn register_with<F, Fut>(
        &self,
        alias: impl Into<String>,
        handler: F,
        options: MethodOptions,
    ) -> Result<(), ServerError>
    where
        F: Fn(Arc<Connection>, Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult> + Send + 'static,
    {
        let alias = alias.into();
        let mut methods = self.methods.write();
        if methods.contains_key(&alias) {
            return Err(ServerError::DuplicateRpcMethod(alias));
        }

        let handler: RpcHandlerFn =
            Arc::new(move |conn, args, kwargs| Box::pin(handler(conn, args, kwargs)));
        methods.insert(
            alias,
            RpcMethod {
                handler,
                requires: options.requires,
                rate_limit: options.rate_limit,
            },
        );
        Ok(())
    }

    /// Returns whether an alias is registered.
    pub fn contains(&self, alias: &str) -> bool {
        self.methods.read().contains_key(alias)
    }

    /// Handles one incoming request. The gates run inline; the handler
    /// itself is spawned as its own task so slow calls never block the
    /// caller's read loop. Every request yields exactly one response with
    /// the original call id, unless the connection closes first.
    pub(crate) async fn dispatch(&self, conn: &Arc<Connection>, request: RpcRequest) {
        let RpcRequest {
            call_id,
            method,
            args,
            kwargs,
        } = request;

        let entry = self.methods.read().get(&method).cloned();
        let Some(entry) = entry else {
            respond(
                conn,
                RpcResponse::err(
                    call_id,
                    RpcErrorCode::MethodNotFound,
                    format!("RPC method {method:?} not found"),
                ),
            )
            .await;
            return;
        };

        if let Some(requires) = &entry.requires {
            if !requires.evaluate(conn) {
                respond(
                    conn,
                    RpcResponse::err(
                        call_id,
                        RpcErrorCode::AccessDenied,
                        format!("access denied for RPC method {method:?}"),
                    ),
                )
                .await;
                return;
            }
        }

        if let Some(rate_limit) = &entry.rate_limit {
            if !conn.limiter().check(&method, rate_limit) {
                respond(
                    conn,
                    RpcResponse::err(
                        call_id,
                        RpcErrorCode::RateLimited,
                        format!("rate limit exceeded for RPC method {method:?}"),
                    ),
                )
                .await;
                if rate_limit.disconnect_on_exceed {
                    conn.close_with(CloseCode::Policy, "policy violation");
                }
                return;
            }
        }

        let handler = entry.handler;
        let semaphore = Arc::clone(&self.semaphore);
        let task_conn = Arc::clone(conn);
        let task = tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let response = match handler(Arc::clone(&task_conn), args, kwargs).await {
                Ok(value) => RpcResponse::ok(call_id, value),
                Err(e) => {
                    tracing::error!("[{}] RPC method {method:?} failed: {e}", task_conn.id());
                    RpcResponse::err(call_id, e.code(), e.to_string())
                }
            };

            if task_conn.is_open() {
                respond(&task_conn, response).await;
            }
        });
        conn.track_rpc_task(task);
    }
}

async fn respond(conn: &Arc<Connection>, response: RpcResponse) {
    if let Err(e) = conn.send_packet(Packet::response(response)).await {
        tracing::debug!("[{}] dropping RPC response: {}", conn.id(), e);
    }
}
