//! User-facing connection lifecycle callbacks.

use crate::connection::Connection;
use crate::error::ServerError;
use async_trait::async_trait;
use std::sync::Arc;
use wsrelay_protocol::Packet;

/// Application callbacks invoked by the server runtime.
///
/// All methods have no-op defaults, so implementations override only what
/// they need. Publish, broadcast and subscription management are reachable
/// from any callback through [`Connection::registry`].
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Called once per connection after the WebSocket handshake, before
    /// any packet is delivered. An error aborts this connection only.
    async fn on_connect(&self, _conn: &Arc<Connection>) -> Result<(), ServerError> {
        Ok(())
    }

    /// Called for every decoded non-RPC packet, in wire order. Errors are
    /// logged and the connection stays open.
    async fn on_receive(&self, _conn: &Arc<Connection>, _packet: Packet) -> Result<(), ServerError> {
        Ok(())
    }

    /// Called once when the connection tears down, before its channel
    /// subscriptions are removed from the registry.
    async fn on_disconnect(&self, _conn: &Arc<Connection>) {}
}

/// Built-in no-op handler for servers driven purely through RPC methods
/// and pull-style [`Connection::recv`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

#[async_trait]
impl Handler for DefaultHandler {}
