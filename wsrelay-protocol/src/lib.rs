//! # wsrelay-protocol
//!
//! Wire protocol for the wsrelay framework.
//!
//! This crate provides:
//! - The `Packet` model shared by server and client
//! - RPC request/response envelopes and stable error codes
//! - JSON wire codec (cross-language default)
//! - Binary wire codec with length prefixes and CRC32C validation

pub mod codec;
pub mod error;
pub mod packet;
pub mod rpc;

pub use codec::WireFormat;
pub use error::{ProtocolError, RpcErrorCode};
pub use packet::{Packet, PacketData, PacketSource};
pub use rpc::{Rpc, RpcRequest, RpcResponse};

/// Binary codec version supported by this implementation.
pub const BINARY_VERSION: u16 = 1;

/// Maximum binary packet payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// WebSocket close code: normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code: policy violation (rate-limit disconnect).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// WebSocket close code: try again later (admission refusal).
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
