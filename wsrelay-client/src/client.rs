//! WebSocket client runtime: connect with retry, RPC calls, recv queue.

use crate::error::ClientError;
use crate::tls::{create_tls_connector, TlsClientConfig};
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, connect_async_tls_with_config};
use wsrelay_protocol::{
    codec, Packet, PacketData, PacketSource, Rpc, RpcErrorCode, RpcRequest, WireFormat,
};

/// Backoff ceiling for connection retries.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Client connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ClientState::Connecting,
            2 => ClientState::Connected,
            3 => ClientState::Closed,
            _ => ClientState::Disconnected,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL (`ws://` or `wss://`).
    pub url: String,
    /// Wire encoding, must match the server.
    pub wire_format: WireFormat,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Default deadline for `send_rpc`, transport and handler time both.
    pub rpc_timeout: Duration,
    /// Inbound packet queue capacity.
    pub max_packet_qsize: usize,
    /// TLS configuration for wss:// (optional).
    pub tls: Option<TlsClientConfig>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            wire_format: WireFormat::Json,
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            max_packet_qsize: 128,
            tls: None,
        }
    }

    pub fn with_wire_format(mut self, wire_format: WireFormat) -> Self {
        self.wire_format = wire_format;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_max_packet_qsize(mut self, qsize: usize) -> Self {
        self.max_packet_qsize = qsize.max(1);
        self
    }

    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Retry behavior for [`Client::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Retry with exponential backoff instead of failing on the first error.
    pub retry: bool,
    /// Maximum number of attempts when retrying.
    pub max_retry_attempt: u32,
    /// Base interval; attempt `k` waits `interval * 2^k` plus jitter.
    pub retry_interval: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            retry: false,
            max_retry_attempt: 3,
            retry_interval: Duration::from_secs(2),
        }
    }
}

impl ConnectOptions {
    pub fn retrying() -> Self {
        Self {
            retry: true,
            ..Default::default()
        }
    }

    pub fn with_max_retry_attempt(mut self, attempts: u32) -> Self {
        self.max_retry_attempt = attempts;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// Per-call options for [`Client::send_rpc_with`].
#[derive(Debug, Clone, Default)]
pub struct RpcCallOptions {
    /// Overrides the config-level RPC deadline.
    pub timeout: Option<Duration>,
    /// Turn a `RATE_LIMITED` response into a typed error instead of
    /// returning the response packet for inspection.
    pub raise_on_rate_limit: bool,
}

impl RpcCallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn raise_on_rate_limit(mut self) -> Self {
        self.raise_on_rate_limit = true;
        self
    }
}

/// Raw or pre-built outbound payload.
#[derive(Debug, Clone)]
pub enum Outbound {
    Packet(Packet),
    Data(PacketData),
}

impl From<Packet> for Outbound {
    fn from(packet: Packet) -> Self {
        Outbound::Packet(packet)
    }
}

impl From<&str> for Outbound {
    fn from(s: &str) -> Self {
        Outbound::Data(s.into())
    }
}

impl From<String> for Outbound {
    fn from(s: String) -> Self {
        Outbound::Data(s.into())
    }
}

impl From<Vec<u8>> for Outbound {
    fn from(b: Vec<u8>) -> Self {
        Outbound::Data(b.into())
    }
}

impl From<Value> for Outbound {
    fn from(v: Value) -> Self {
        Outbound::Data(v.into())
    }
}

type OnReceiveFn = Arc<dyn Fn(Packet) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

type PendingCalls = Arc<Mutex<HashMap<String, oneshot::Sender<Packet>>>>;

/// A WebSocket client.
///
/// Non-RPC packets go to the `on_receive` callback when one is set,
/// otherwise to the pull queue behind [`Client::recv`]. RPC responses are
/// routed by call id to their awaiting [`Client::send_rpc`] callers.
pub struct Client {
    config: ClientConfig,
    state: Arc<AtomicU8>,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: PendingCalls,
    inbound_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Packet>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    on_receive: Option<OnReceiveFn>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: Arc::new(AtomicU8::new(ClientState::Disconnected as u8)),
            writer_tx: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            inbound_rx: tokio::sync::Mutex::new(None),
            read_task: Mutex::new(None),
            on_receive: None,
        }
    }

    /// Installs an async callback invoked for every non-RPC packet,
    /// replacing the pull queue.
    pub fn with_on_receive<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_receive = Some(Arc::new(move |packet| Box::pin(callback(packet))));
        self
    }

    /// Current connection state.
    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Connects to the server, optionally retrying with exponential
    /// backoff and jitter.
    pub async fn connect(&self, options: ConnectOptions) -> Result<(), ClientError> {
        if !options.retry {
            return self.connect_once().await;
        }

        for attempt in 0..options.max_retry_attempt {
            match self.connect_once().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let backoff = options
                        .retry_interval
                        .saturating_mul(1u32 << attempt.min(16))
                        .min(MAX_BACKOFF);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
                    tracing::warn!(
                        "connect attempt {} failed: {}, retrying in {:?}",
                        attempt + 1,
                        e,
                        backoff + jitter
                    );
                    tokio::time::sleep(backoff + jitter).await;
                }
            }
        }

        self.close().await;
        Err(ClientError::ConnectionFailed(options.max_retry_attempt))
    }

    async fn connect_once(&self) -> Result<(), ClientError> {
        if !self.config.url.starts_with("ws://") && !self.config.url.starts_with("wss://") {
            return Err(ClientError::InvalidUrl(self.config.url.clone()));
        }

        // Tear down any previous connection first.
        self.shutdown_io(ClientState::Disconnected);
        self.state
            .store(ClientState::Connecting as u8, Ordering::Release);

        let result = self.open_socket().await;
        if result.is_err() {
            self.state
                .store(ClientState::Disconnected as u8, Ordering::Release);
        }
        result
    }

    async fn open_socket(&self) -> Result<(), ClientError> {
        let connect = async {
            if let Some(ref tls) = self.config.tls {
                let connector = create_tls_connector(tls)?;
                connect_async_tls_with_config(self.config.url.as_str(), None, false, Some(connector))
                    .await
                    .map_err(ClientError::from)
            } else {
                connect_async(self.config.url.as_str())
                    .await
                    .map_err(ClientError::from)
            }
        };

        let (ws, _response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| ClientError::ConnectTimeout)??;

        let (mut sink, stream) = ws.split();

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() {
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.max_packet_qsize);
        let read_task = tokio::spawn(read_loop(
            stream,
            self.config.wire_format,
            Arc::clone(&self.pending),
            inbound_tx,
            self.on_receive.clone(),
            Arc::clone(&self.state),
        ));

        *self.writer_tx.lock() = Some(writer_tx);
        *self.inbound_rx.lock().await = Some(inbound_rx);
        *self.read_task.lock() = Some(read_task);
        self.state
            .store(ClientState::Connected as u8, Ordering::Release);
        tracing::info!("connected to {}", self.config.url);
        Ok(())
    }

    /// Sends a packet or raw payload. Raw forms are wrapped into a
    /// `CLIENT`-source packet.
    pub fn send(&self, data: impl Into<Outbound>) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let packet = match data.into() {
            Outbound::Packet(packet) => packet,
            Outbound::Data(data) => Packet::new(PacketSource::Client, data),
        };
        self.transmit(&packet)
    }

    fn transmit(&self, packet: &Packet) -> Result<(), ClientError> {
        let message = match self.config.wire_format {
            WireFormat::Json => Message::Text(codec::json::encode(packet)?.into()),
            WireFormat::Binary => Message::Binary(codec::binary::encode(packet)?),
        };
        let guard = self.writer_tx.lock();
        let tx = guard.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(message).map_err(|_| ClientError::ConnectionClosed)
    }

    /// Calls a remote method and awaits its response.
    pub async fn send_rpc(&self, method: &str, args: Vec<Value>) -> Result<Packet, ClientError> {
        self.send_rpc_with(method, args, Map::new(), RpcCallOptions::default())
            .await
    }

    /// Calls a remote method with keyword arguments and per-call options.
    ///
    /// The deadline covers transport and handler time both. On timeout the
    /// pending entry is removed and a late response is dropped with a
    /// warning by the read loop.
    pub async fn send_rpc_with(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: RpcCallOptions,
    ) -> Result<Packet, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let request = RpcRequest::new(method).with_args(args).with_kwargs(kwargs);
        let call_id = request.call_id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(call_id.clone(), tx);

        if let Err(e) = self.transmit(&Packet::request(request)) {
            self.pending.lock().remove(&call_id);
            return Err(e);
        }

        let deadline = options.timeout.unwrap_or(self.config.rpc_timeout);
        let packet = match tokio::time::timeout(deadline, rx).await {
            Err(_) => {
                self.pending.lock().remove(&call_id);
                return Err(ClientError::RpcTimeout);
            }
            Ok(Err(_)) => return Err(ClientError::ConnectionClosed),
            Ok(Ok(packet)) => packet,
        };

        if options.raise_on_rate_limit {
            if let Some(response) = packet.rpc_response() {
                if response.error == Some(RpcErrorCode::RateLimited) {
                    return Err(ClientError::RateLimited);
                }
            }
        }

        Ok(packet)
    }

    /// Pulls the next non-RPC packet, waiting up to `timeout` if given.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Packet, ClientError> {
        let mut guard = self.inbound_rx.lock().await;
        let rx = guard.as_mut().ok_or(ClientError::NotConnected)?;
        let packet = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx.recv())
                .await
                .map_err(|_| ClientError::RecvTimeout)?,
            None => rx.recv().await,
        };
        packet.ok_or(ClientError::ConnectionClosed)
    }

    /// Closes the connection gracefully. Idempotent.
    pub async fn close(&self) {
        self.shutdown_io(ClientState::Closed);
    }

    fn shutdown_io(&self, target: ClientState) {
        if let Some(tx) = self.writer_tx.lock().take() {
            let _ = tx.send(Message::Close(None));
        }
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
        self.pending.lock().clear();
        self.state.store(target as u8, Ordering::Release);
    }
}

async fn read_loop(
    mut stream: impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    wire: WireFormat,
    pending: PendingCalls,
    inbound_tx: mpsc::Sender<Packet>,
    on_receive: Option<OnReceiveFn>,
    state: Arc<AtomicU8>,
) {
    while let Some(msg) = stream.next().await {
        let decoded = match msg {
            Ok(Message::Text(text)) => match wire {
                WireFormat::Json => codec::json::decode(&text),
                WireFormat::Binary => Err(wsrelay_protocol::ProtocolError::UnexpectedFrame("text")),
            },
            Ok(Message::Binary(data)) => match wire {
                WireFormat::Binary => codec::binary::decode(&data),
                WireFormat::Json => Err(wsrelay_protocol::ProtocolError::UnexpectedFrame("binary")),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("read error: {}", e);
                break;
            }
        };

        let packet = match decoded {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("dropping undecodable packet: {}", e);
                continue;
            }
        };

        if packet.source == PacketSource::Rpc {
            if let Some(Rpc::Response(response)) = &packet.rpc {
                match pending.lock().remove(&response.call_id) {
                    Some(tx) => {
                        let _ = tx.send(packet);
                    }
                    None => {
                        tracing::warn!("dropping unmatched RPC response {}", response.call_id);
                    }
                }
                continue;
            }
        }

        match &on_receive {
            Some(callback) => callback(packet).await,
            None => {
                if inbound_tx.send(packet).await.is_err() {
                    break;
                }
            }
        }
    }

    // Only downgrade from Connected; an intentional close stays Closed.
    let _ = state.compare_exchange(
        ClientState::Connected as u8,
        ClientState::Disconnected as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builders() {
        let config = ClientConfig::new("ws://localhost:9180")
            .with_wire_format(WireFormat::Binary)
            .with_rpc_timeout(Duration::from_secs(5))
            .with_max_packet_qsize(0);
        assert_eq!(config.wire_format, WireFormat::Binary);
        assert_eq!(config.rpc_timeout, Duration::from_secs(5));
        // Queue capacity is clamped to at least one slot.
        assert_eq!(config.max_packet_qsize, 1);
    }

    #[tokio::test]
    async fn test_rejects_non_websocket_url() {
        let client = Client::new(ClientConfig::new("http://localhost:1"));
        assert!(matches!(
            client.connect(ConnectOptions::default()).await,
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let client = Client::new(ClientConfig::new("ws://127.0.0.1:1"));
        assert!(matches!(client.send("hi"), Err(ClientError::NotConnected)));
        assert!(matches!(
            client.send_rpc("ping", vec![]).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_without_retry_fails_fast() {
        // Port 1 is essentially never listening.
        let client = Client::new(ClientConfig::new("ws://127.0.0.1:1"));
        let result = client.connect(ConnectOptions::default()).await;
        assert!(result.is_err());
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let client = Client::new(ClientConfig::new("ws://127.0.0.1:1"));
        let options = ConnectOptions::retrying()
            .with_max_retry_attempt(2)
            .with_retry_interval(Duration::from_millis(10));
        let result = client.connect(options).await;
        assert!(matches!(result, Err(ClientError::ConnectionFailed(2))));
        assert_eq!(client.state(), ClientState::Closed);
    }
}
