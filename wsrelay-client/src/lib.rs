//! # wsrelay-client
//!
//! WebSocket client for the wsrelay framework.
//!
//! This crate provides:
//! - Connection management with exponential-backoff retry
//! - RPC calls with response correlation and deadlines
//! - Pull-style receive queue or push-style receive callback
//! - Optional TLS (wss://) with custom CA support

pub mod client;
pub mod error;
pub mod tls;

pub use client::{Client, ClientConfig, ClientState, ConnectOptions, Outbound, RpcCallOptions};
pub use error::ClientError;
pub use tls::TlsClientConfig;
