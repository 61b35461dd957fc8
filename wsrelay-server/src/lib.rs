//! # wsrelay-server
//!
//! WebSocket server runtime for the wsrelay framework.
//!
//! This crate provides:
//! - Connection lifecycle management over plain and TLS sockets
//! - RPC dispatch with access-control predicates and rate limiting
//! - Pub/sub channels and broadcast with predicate-filtered delivery
//! - Per-connection session state and pull-style packet queues

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod predicate;
pub mod ratelimit;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod stream;
pub mod tls;

pub use config::{Config, ConfigError, LimitsConfig, NetworkConfig, TlsConfig};
pub use connection::{Connection, ConnectionState, Outgoing, SendPolicy};
pub use error::ServerError;
pub use handler::{DefaultHandler, Handler};
pub use predicate::Predicate;
pub use ratelimit::{parse_period, RateLimit};
pub use registry::{IntoChannels, Registry};
pub use rpc::{MethodOptions, RpcError, RpcRegistry, RpcResult};
pub use server::{Server, ServerConfig, ServerState, ServerStats};
pub use tls::create_tls_acceptor;

/// WebSocket close codes, re-exported for close reasons.
pub use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
