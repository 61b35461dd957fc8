//! Per-socket connection object: session state, subscriptions and queues.

use crate::error::ServerError;
use crate::ratelimit::RateLimiter;
use crate::registry::{IntoChannels, Registry};
use crate::rpc::RpcRegistry;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use wsrelay_protocol::{codec, Packet, PacketData, PacketSource, WireFormat};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// What to do when the outbound buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SendPolicy {
    /// Block the producer until the writer drains the buffer.
    #[default]
    Block,
    /// Evict the oldest queued message to make room.
    DropOldest,
}

/// Anything a connection can send: a pre-built packet or raw data that
/// gets wrapped into a `SERVER`-source packet.
#[derive(Debug, Clone)]
pub enum Outgoing {
    Packet(Packet),
    Data(PacketData),
}

impl From<Packet> for Outgoing {
    fn from(packet: Packet) -> Self {
        Outgoing::Packet(packet)
    }
}

impl From<&str> for Outgoing {
    fn from(s: &str) -> Self {
        Outgoing::Data(s.into())
    }
}

impl From<String> for Outgoing {
    fn from(s: String) -> Self {
        Outgoing::Data(s.into())
    }
}

impl From<Vec<u8>> for Outgoing {
    fn from(b: Vec<u8>) -> Self {
        Outgoing::Data(b.into())
    }
}

impl From<Value> for Outgoing {
    fn from(v: Value) -> Self {
        Outgoing::Data(v.into())
    }
}

impl From<PacketData> for Outgoing {
    fn from(d: PacketData) -> Self {
        Outgoing::Data(d)
    }
}

struct SendQueueInner {
    queue: VecDeque<Message>,
    closed: bool,
}

/// Bounded outbound buffer between producers and the socket writer task.
struct SendQueue {
    inner: Mutex<SendQueueInner>,
    capacity: usize,
    policy: SendPolicy,
    readable: Notify,
    writable: Notify,
}

impl SendQueue {
    fn new(capacity: usize, policy: SendPolicy) -> Self {
        Self {
            inner: Mutex::new(SendQueueInner {
                queue: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            capacity,
            policy,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    async fn push(&self, msg: Message) -> Result<(), ServerError> {
        let mut msg = Some(msg);
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(ServerError::ConnectionClosed);
                }
                if inner.queue.len() < self.capacity {
                    inner.queue.push_back(msg.take().unwrap());
                    self.readable.notify_one();
                    return Ok(());
                }
                if self.policy == SendPolicy::DropOldest {
                    inner.queue.pop_front();
                    inner.queue.push_back(msg.take().unwrap());
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            self.writable.notified().await;
        }
    }

    /// Appends a control frame regardless of capacity or closed state.
    fn push_control(&self, msg: Message) {
        self.inner.lock().queue.push_back(msg);
        self.readable.notify_one();
    }

    async fn pop(&self) -> Option<Message> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(msg) = inner.queue.pop_front() {
                    self.writable.notify_one();
                    return Some(msg);
                }
                if inner.closed {
                    return None;
                }
            }
            self.readable.notified().await;
        }
    }

    fn close(&self) {
        self.inner.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

/// One live client connection.
///
/// Holds the dynamic session bag read by predicates, the channel
/// subscription mirror, the outbound send buffer, an inbound queue for
/// pull-style consumers and the per-connection rate-limit buckets.
pub struct Connection {
    id: Uuid,
    remote_addr: SocketAddr,
    state: AtomicU8,
    wire: WireFormat,
    registry: Arc<Registry>,
    rpc: Arc<RpcRegistry>,
    session: RwLock<HashMap<String, Value>>,
    channels: Mutex<HashSet<String>>,
    limiter: RateLimiter,
    outbound: SendQueue,
    inbound_tx: Mutex<Option<mpsc::Sender<Packet>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    rpc_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn new(
        remote_addr: SocketAddr,
        registry: Arc<Registry>,
        rpc: Arc<RpcRegistry>,
        wire: WireFormat,
        send_policy: SendPolicy,
        send_qsize: usize,
        packet_qsize: usize,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(packet_qsize.max(1));
        Arc::new(Self {
            id: Uuid::new_v4(),
            remote_addr,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            wire,
            registry,
            rpc,
            session: RwLock::new(HashMap::new()),
            channels: Mutex::new(HashSet::new()),
            limiter: RateLimiter::new(),
            outbound: SendQueue::new(send_qsize.max(1), send_policy),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            rpc_tasks: Mutex::new(Vec::new()),
        })
    }

    /// Unique id assigned at accept time.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the connection still accepts sends.
    pub fn is_open(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Open
        )
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Transitions to `Closing` if currently accepting traffic.
    /// Returns false if the connection was already closing or closed.
    fn transition_to_closing(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    ConnectionState::Closing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    // ------------------------------------------------------------------
    // Session bag
    // ------------------------------------------------------------------

    /// Sets a session attribute.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.session.write().insert(key.into(), value.into());
    }

    /// Returns a session attribute, if set.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.session.read().get(key).cloned()
    }

    /// Returns whether a session attribute exists.
    pub fn contains(&self, key: &str) -> bool {
        self.session.read().contains_key(key)
    }

    /// Removes a session attribute, returning the previous value.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.session.write().remove(key)
    }

    /// Runs `f` with a read view of the whole session bag.
    pub fn with_session<R>(&self, f: impl FnOnce(&HashMap<String, Value>) -> R) -> R {
        f(&self.session.read())
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    /// Channels this connection is currently subscribed to.
    pub fn subscribed_channels(&self) -> HashSet<String> {
        self.channels.lock().clone()
    }

    /// Joins one or more channels. Idempotent.
    pub fn subscribe(self: &Arc<Self>, channels: impl IntoChannels) {
        self.registry.subscribe(self, channels);
    }

    /// Leaves one or more channels. Unknown channels are ignored.
    pub fn unsubscribe(self: &Arc<Self>, channels: impl IntoChannels) {
        self.registry.unsubscribe(self, channels);
    }

    /// The registry this connection belongs to, for publish/broadcast
    /// from handler code.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The RPC method registry, for registering methods from handler code
    /// at runtime.
    pub fn rpc_methods(&self) -> &RpcRegistry {
        &self.rpc
    }

    pub(crate) fn add_channel(&self, name: String) {
        self.channels.lock().insert(name);
    }

    pub(crate) fn remove_channel(&self, name: &str) {
        self.channels.lock().remove(name);
    }

    pub(crate) fn take_channels(&self) -> HashSet<String> {
        std::mem::take(&mut self.channels.lock())
    }

    // ------------------------------------------------------------------
    // Sending and receiving
    // ------------------------------------------------------------------

    /// Sends a packet or raw payload to the peer.
    ///
    /// Raw strings and byte payloads are wrapped into a `SERVER`-source
    /// packet. Encoding happens here so that encode failures surface to
    /// the caller; a full buffer blocks or evicts per the send policy.
    pub async fn send(&self, payload: impl Into<Outgoing>) -> Result<(), ServerError> {
        let packet = match payload.into() {
            Outgoing::Packet(packet) => packet,
            Outgoing::Data(data) => Packet::new(PacketSource::Server, data),
        };
        self.send_packet(packet).await
    }

    /// Sends a pre-built packet to the peer.
    pub async fn send_packet(&self, packet: Packet) -> Result<(), ServerError> {
        if !self.is_open() {
            return Err(ServerError::ConnectionClosed);
        }
        let message = self.encode(&packet)?;
        self.outbound.push(message).await
    }

    fn encode(&self, packet: &Packet) -> Result<Message, ServerError> {
        Ok(match self.wire {
            WireFormat::Json => Message::Text(codec::json::encode(packet)?.into()),
            WireFormat::Binary => Message::Binary(codec::binary::encode(packet)?),
        })
    }

    /// Pulls the next inbound packet, waiting up to `timeout` if given.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Packet, ServerError> {
        let mut rx = self.inbound_rx.lock().await;
        let packet = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx.recv())
                .await
                .map_err(|_| ServerError::RecvTimeout)?,
            None => rx.recv().await,
        };
        packet.ok_or(ServerError::ConnectionClosed)
    }

    /// Queues an inbound packet for pull-style consumers. A full queue
    /// drops the packet rather than stalling the read loop.
    pub(crate) fn push_inbound(&self, packet: Packet) {
        let guard = self.inbound_tx.lock();
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(packet).is_err() {
                tracing::warn!("[{}] inbound queue full, dropping packet", self.id);
            }
        }
    }

    pub(crate) fn close_inbound(&self) {
        self.inbound_tx.lock().take();
    }

    /// Next message for the socket writer task. `None` once the
    /// connection is closed and the buffer is drained.
    pub(crate) async fn next_outbound(&self) -> Option<Message> {
        self.outbound.pop().await
    }

    pub(crate) fn push_control(&self, message: Message) {
        self.outbound.push_control(message);
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    /// Initiates a normal close. Idempotent; safe to call from any task.
    pub fn close(&self) {
        self.close_with(CloseCode::Normal, "");
    }

    /// Initiates a close with an explicit code and reason.
    ///
    /// After this returns no further send succeeds; already queued
    /// messages are drained by the writer before the close frame.
    pub fn close_with(&self, code: CloseCode, reason: &str) {
        if !self.transition_to_closing() {
            return;
        }
        self.abort_rpc_tasks();
        self.outbound.push_control(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })));
        self.outbound.close();
    }

    pub(crate) fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub(crate) fn track_rpc_task(&self, task: JoinHandle<()>) {
        let mut tasks = self.rpc_tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    pub(crate) fn abort_rpc_tasks(&self) {
        for task in self.rpc_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("subscriptions", &self.channels.lock().len())
            .finish()
    }
}
