//! WebSocket server runtime.

use crate::config::Config;
use crate::connection::{Connection, ConnectionState, SendPolicy};
use crate::error::ServerError;
use crate::handler::Handler;
use crate::registry::Registry;
use crate::rpc::RpcRegistry;
use crate::stream::AcceptedStream;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::WebSocketStream;
use wsrelay_protocol::{codec, ProtocolError, Rpc, WireFormat};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Wire encoding shared with clients.
    pub wire_format: WireFormat,
    /// Maximum concurrent connections (None = unlimited).
    pub max_connections: Option<usize>,
    /// Inbound packet queue capacity per connection.
    pub packet_qsize: usize,
    /// Outbound send buffer capacity per connection.
    pub send_qsize: usize,
    /// Behavior when the outbound buffer is full.
    pub send_policy: SendPolicy,
    /// Keepalive ping period (None = no pings).
    pub ping_interval: Option<Duration>,
    /// TLS acceptor (if TLS is enabled).
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9180".parse().unwrap(),
            wire_format: WireFormat::Json,
            max_connections: None,
            packet_qsize: 128,
            send_qsize: 128,
            send_policy: SendPolicy::Block,
            ping_interval: None,
            tls_acceptor: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("wire_format", &self.wire_format)
            .field("max_connections", &self.max_connections)
            .field("packet_qsize", &self.packet_qsize)
            .field("send_qsize", &self.send_qsize)
            .field("send_policy", &self.send_policy)
            .field("ping_interval", &self.ping_interval)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds a runtime config from file configuration. TLS is wired
    /// separately since acceptor construction can fail.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            wire_format: config.network.wire_format,
            max_connections: config.limits.max_connections,
            packet_qsize: config.limits.packet_qsize,
            send_qsize: config.limits.send_qsize,
            ping_interval: config.network.ping_interval_secs.map(Duration::from_secs),
            ..Default::default()
        }
    }

    pub fn with_wire_format(mut self, wire_format: WireFormat) -> Self {
        self.wire_format = wire_format;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn with_packet_qsize(mut self, qsize: usize) -> Self {
        self.packet_qsize = qsize;
        self
    }

    pub fn with_send_qsize(mut self, qsize: usize) -> Self {
        self.send_qsize = qsize;
        self
    }

    pub fn with_send_policy(mut self, policy: SendPolicy) -> Self {
        self.send_policy = policy;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }
}

/// Server lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Init,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Server counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_rejected: AtomicU64,
}

struct Shared {
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    rpc: Arc<RpcRegistry>,
    registry: Arc<Registry>,
    shutdown: broadcast::Sender<()>,
    stats: Arc<ServerStats>,
}

/// The WebSocket server: accepts sockets, routes frames into packets,
/// hands RPC requests to the dispatcher and everything else to the
/// application handler.
pub struct Server {
    shared: Arc<Shared>,
    state: watch::Sender<ServerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    conn_guard: Mutex<Option<mpsc::Sender<()>>>,
    conn_done: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl Server {
    /// Creates a new server. Methods registered on the RPC registry
    /// before construction surface conflicts as startup errors; handler
    /// code can add more at runtime via [`Connection::rpc_methods`].
    pub fn new(config: ServerConfig, handler: impl Handler, rpc: RpcRegistry) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (state, _) = watch::channel(ServerState::Init);
        let (guard_tx, guard_rx) = mpsc::channel(1);

        Self {
            shared: Arc::new(Shared {
                config,
                handler: Arc::new(handler),
                rpc: Arc::new(rpc),
                registry: Arc::new(Registry::new()),
                shutdown,
                stats: Arc::new(ServerStats::default()),
            }),
            state,
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            conn_guard: Mutex::new(Some(guard_tx)),
            conn_done: tokio::sync::Mutex::new(guard_rx),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// The live-connection and channel registry, for publish/broadcast
    /// from outside handler callbacks.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.shared.registry)
    }

    /// Server counters.
    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.shared.stats)
    }

    /// The actual bound address, available once started. Useful when
    /// binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Binds the listener and starts accepting connections.
    pub async fn start(&self) -> Result<(), ServerError> {
        let entered = self.state.send_if_modified(|state| {
            if *state == ServerState::Init {
                *state = ServerState::Starting;
                true
            } else {
                false
            }
        });
        if !entered {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(self.shared.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);

        let guard_tx = self
            .conn_guard
            .lock()
            .clone()
            .ok_or(ServerError::ShuttingDown)?;
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(accept_loop(listener, shared, guard_tx));
        *self.accept_task.lock() = Some(task);

        let _ = self.state.send(ServerState::Running);
        let mode = if self.shared.config.tls_enabled() {
            "wss"
        } else {
            "ws"
        };
        tracing::info!("server listening on {} ({})", local_addr, mode);
        Ok(())
    }

    /// Starts the server (if needed) and blocks until it is closed.
    pub async fn serve_forever(&self) -> Result<(), ServerError> {
        match self.start().await {
            Ok(()) | Err(ServerError::AlreadyRunning) => {}
            Err(e) => return Err(e),
        }

        let mut state_rx = self.state.subscribe();
        while *state_rx.borrow() != ServerState::Stopped {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Stops accepting, closes every live connection and waits for their
    /// teardown. Calling close again is a no-op.
    pub async fn close(&self) {
        let entered = self.state.send_if_modified(|state| {
            if matches!(state, ServerState::Starting | ServerState::Running) {
                *state = ServerState::Stopping;
                true
            } else {
                false
            }
        });
        if !entered {
            return;
        }

        tracing::info!("server shutting down");
        let _ = self.shared.shutdown.send(());

        for conn in self.shared.registry.clients() {
            conn.close_with(CloseCode::Normal, "server shutting down");
        }

        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }

        // Dropping the last guard sender lets recv() observe that every
        // connection task has finished.
        drop(self.conn_guard.lock().take());
        let mut done = self.conn_done.lock().await;
        let _ = done.recv().await;

        let _ = self.state.send(ServerState::Stopped);
        tracing::info!("server stopped");
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, guard_tx: mpsc::Sender<()>) {
    let mut shutdown_rx = shared.shutdown.subscribe();

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((tcp, addr)) => {
                    shared.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                    let shared = Arc::clone(&shared);
                    let guard = guard_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_socket(tcp, addr, &shared).await {
                            tracing::debug!("[{}] connection error: {}", addr, e);
                        }
                        drop(guard);
                    });
                }
                Err(e) => {
                    tracing::error!("accept error: {}", e);
                }
            },
            _ = shutdown_rx.recv() => break,
        }
    }
}

async fn handle_socket(
    tcp: TcpStream,
    addr: SocketAddr,
    shared: &Arc<Shared>,
) -> Result<(), ServerError> {
    let stream = match &shared.config.tls_acceptor {
        Some(acceptor) => {
            let tls = acceptor
                .accept(tcp)
                .await
                .map_err(|e| ServerError::TlsHandshake(e.to_string()))?;
            AcceptedStream::Tls { stream: tls }
        }
        None => AcceptedStream::Plain { stream: tcp },
    };
    let is_tls = stream.is_tls();

    let ws = tokio_tungstenite::accept_async(stream).await?;

    if let Some(max) = shared.config.max_connections {
        if shared.registry.client_count() >= max {
            tracing::warn!("connection limit reached, refusing {}", addr);
            shared
                .stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            let (mut sink, _) = ws.split();
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Again,
                    reason: "server at maximum capacity, try again later".into(),
                })))
                .await;
            let _ = sink.close().await;
            return Ok(());
        }
    }

    let (sink, mut ws_stream) = ws.split();
    let conn = Connection::new(
        addr,
        Arc::clone(&shared.registry),
        Arc::clone(&shared.rpc),
        shared.config.wire_format,
        shared.config.send_policy,
        shared.config.send_qsize,
        shared.config.packet_qsize,
    );
    shared.registry.insert(Arc::clone(&conn));
    tracing::info!(
        "new connection from {}{}",
        addr,
        if is_tls { " (TLS)" } else { "" }
    );

    let writer = tokio::spawn(write_loop(sink, Arc::clone(&conn)));

    match shared.handler.on_connect(&conn).await {
        Ok(()) => {
            conn.set_state(ConnectionState::Open);
            read_loop(&mut ws_stream, &conn, shared).await;
        }
        Err(e) => {
            tracing::warn!("[{}] on_connect failed: {}", conn.id(), e);
            conn.close_with(CloseCode::Normal, "");
        }
    }

    // Teardown: closing state, cancelled handlers, user callback,
    // subscription cleanup, then the writer drains the close frame.
    conn.close_with(CloseCode::Normal, "");
    shared.handler.on_disconnect(&conn).await;
    shared.registry.remove(&conn);
    conn.close_inbound();
    let _ = tokio::time::timeout(Duration::from_secs(5), writer).await;
    conn.set_state(ConnectionState::Closed);
    tracing::info!("connection {} ({}) closed", conn.id(), addr);

    Ok(())
}

async fn read_loop(
    stream: &mut SplitStream<WebSocketStream<AcceptedStream>>,
    conn: &Arc<Connection>,
    shared: &Arc<Shared>,
) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut ping = shared.config.ping_interval.map(|period| {
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    loop {
        if !conn.is_open() {
            break;
        }

        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let decoded = match shared.config.wire_format {
                        WireFormat::Json => codec::json::decode(&text),
                        WireFormat::Binary => Err(ProtocolError::UnexpectedFrame("text")),
                    };
                    handle_packet(conn, shared, decoded).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    let decoded = match shared.config.wire_format {
                        WireFormat::Binary => codec::binary::decode(&data),
                        WireFormat::Json => Err(ProtocolError::UnexpectedFrame("binary")),
                    };
                    handle_packet(conn, shared, decoded).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong are answered by the transport
                Some(Err(e)) => {
                    tracing::debug!("[{}] read error: {}", conn.id(), e);
                    break;
                }
            },
            _ = tick(&mut ping) => {
                conn.push_control(Message::Ping(Bytes::new()));
            }
            _ = shutdown_rx.recv() => {
                conn.close_with(CloseCode::Normal, "server shutting down");
                break;
            }
        }
    }
}

/// Routes one decoded packet: RPC requests to the dispatcher, everything
/// else to `on_receive` and the connection's pull queue. Decode failures
/// drop the packet and keep the connection open.
async fn handle_packet(
    conn: &Arc<Connection>,
    shared: &Arc<Shared>,
    decoded: Result<wsrelay_protocol::Packet, ProtocolError>,
) {
    let packet = match decoded {
        Ok(packet) => packet,
        Err(e) => {
            tracing::warn!("[{}] dropping undecodable packet: {}", conn.id(), e);
            return;
        }
    };

    if matches!(packet.rpc, Some(Rpc::Request(_))) {
        if let Some(Rpc::Request(request)) = packet.rpc {
            shared.rpc.dispatch(conn, request).await;
        }
        return;
    }

    conn.push_inbound(packet.clone());
    if let Err(e) = shared.handler.on_receive(conn, packet).await {
        tracing::warn!("[{}] on_receive failed: {}", conn.id(), e);
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocketStream<AcceptedStream>, Message>,
    conn: Arc<Connection>,
) {
    while let Some(msg) = conn.next_outbound().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            tracing::debug!("[{}] write error: {}", conn.id(), e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
