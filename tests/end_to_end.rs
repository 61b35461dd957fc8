//! End-to-end tests driving a real server with a real client.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use wsrelay_client::{Client, ClientConfig, ClientError, ConnectOptions, RpcCallOptions};
use wsrelay_protocol::{PacketSource, RpcErrorCode, WireFormat};
use wsrelay_server::{
    Connection, DefaultHandler, Handler, MethodOptions, Predicate, RateLimit, RpcError,
    RpcRegistry, Server, ServerConfig, ServerError,
};

fn local_config() -> ServerConfig {
    ServerConfig::new("127.0.0.1:0".parse().unwrap())
}

async fn start(
    config: ServerConfig,
    handler: impl Handler,
    rpc: RpcRegistry,
) -> (Arc<Server>, String) {
    let server = Arc::new(Server::new(config, handler, rpc));
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, format!("ws://{}", addr))
}

async fn connect(url: &str) -> Client {
    let client = Client::new(ClientConfig::new(url));
    client.connect(ConnectOptions::default()).await.unwrap();
    client
}

/// Registers the channel-management methods the relay tests use.
fn pubsub_registry() -> RpcRegistry {
    let rpc = RpcRegistry::new(64);
    rpc.register("join", |conn, args, _kwargs| async move {
        let channel = channel_arg(&args)?;
        conn.subscribe(channel);
        Ok(json!(true))
    })
    .unwrap();
    rpc.register("announce", |conn, args, _kwargs| async move {
        let channel = channel_arg(&args)?;
        let message = args
            .get(1)
            .cloned()
            .ok_or_else(|| RpcError::invalid_arguments("announce(channel, message)"))?;
        let delivered = conn
            .registry()
            .publish(channel, message, &HashSet::from([conn.id()]), None)
            .await
            .map_err(|e| RpcError::internal(e.to_string()))?;
        Ok(json!(delivered))
    })
    .unwrap();
    rpc
}

fn channel_arg(args: &[Value]) -> Result<String, RpcError> {
    args.first()
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::invalid_arguments("expected a channel name"))
}

#[tokio::test]
async fn test_echo_rpc() {
    let rpc = RpcRegistry::new(16);
    rpc.register("add", |_conn, args, _kwargs| async move {
        let a = args.first().and_then(Value::as_i64).unwrap_or_default();
        let b = args.get(1).and_then(Value::as_i64).unwrap_or_default();
        Ok(json!(a + b))
    })
    .unwrap();

    let (server, url) = start(local_config(), DefaultHandler, rpc).await;
    let client = connect(&url).await;

    let packet = tokio::time::timeout(
        Duration::from_secs(1),
        client.send_rpc("add", vec![json!(10), json!(20)]),
    )
    .await
    .expect("no response within one second")
    .unwrap();

    let response = packet.rpc_response().unwrap();
    assert_eq!(response.response, json!(30));
    assert!(response.error.is_none());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_falsy_rpc_return_survives() {
    let rpc = RpcRegistry::new(16);
    rpc.register("nop", |_conn, _args, _kwargs| async move { Ok(Value::Null) })
        .unwrap();

    let (server, url) = start(local_config(), DefaultHandler, rpc).await;
    let client = connect(&url).await;

    let packet = client.send_rpc("nop", vec![]).await.unwrap();
    let response = packet.rpc_response().unwrap();
    assert_eq!(response.response, Value::Null);
    assert!(response.error.is_none());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_unknown_method() {
    let (server, url) = start(local_config(), DefaultHandler, RpcRegistry::new(16)).await;
    let client = connect(&url).await;

    let packet = client.send_rpc("no_such_method", vec![]).await.unwrap();
    assert_eq!(
        packet.rpc_response().unwrap().error,
        Some(RpcErrorCode::MethodNotFound)
    );

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_access_control_via_session_bag() {
    let rpc = RpcRegistry::new(16);
    rpc.register("login", |conn, _args, _kwargs| async move {
        conn.set("is_admin", true);
        Ok(json!(true))
    })
    .unwrap();
    rpc.register_with(
        "secret",
        |_conn, _args, _kwargs| async move { Ok(json!("classified")) },
        MethodOptions::new().requires(Predicate::is("is_admin")),
    )
    .unwrap();

    let (server, url) = start(local_config(), DefaultHandler, rpc).await;
    let client = connect(&url).await;

    let packet = client.send_rpc("secret", vec![]).await.unwrap();
    assert_eq!(
        packet.rpc_response().unwrap().error,
        Some(RpcErrorCode::AccessDenied)
    );

    client.send_rpc("login", vec![]).await.unwrap();

    let packet = client.send_rpc("secret", vec![]).await.unwrap();
    let response = packet.rpc_response().unwrap();
    assert!(response.error.is_none());
    assert_eq!(response.response, json!("classified"));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_channel_fanout_with_exclusion() {
    let (server, url) = start(local_config(), DefaultHandler, pubsub_registry()).await;

    let a = connect(&url).await;
    let b = connect(&url).await;
    let c = connect(&url).await;
    for client in [&a, &b, &c] {
        client.send_rpc("join", vec![json!("room1")]).await.unwrap();
    }

    let packet = a
        .send_rpc("announce", vec![json!("room1"), json!("hi")])
        .await
        .unwrap();
    assert_eq!(packet.rpc_response().unwrap().response, json!(2));

    for client in [&b, &c] {
        let received = client.recv(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(received.source, PacketSource::Channel);
        assert_eq!(received.channel.as_deref(), Some("room1"));
        assert_eq!(received.data.unwrap().as_str().unwrap(), "hi");
    }

    // The publisher excluded itself.
    assert!(matches!(
        a.recv(Some(Duration::from_millis(200))).await,
        Err(ClientError::RecvTimeout)
    ));

    for client in [a, b, c] {
        client.close().await;
    }
    server.close().await;
}

#[tokio::test]
async fn test_broadcast_with_predicate() {
    let rpc = RpcRegistry::new(16);
    rpc.register("promote", |conn, _args, _kwargs| async move {
        conn.set("vip", true);
        Ok(json!(true))
    })
    .unwrap();

    let (server, url) = start(local_config(), DefaultHandler, rpc).await;
    let vip = connect(&url).await;
    let pleb = connect(&url).await;
    vip.send_rpc("promote", vec![]).await.unwrap();

    let delivered = server
        .registry()
        .broadcast("vip only", &HashSet::new(), Some(&Predicate::is("vip")))
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let received = vip.recv(Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(received.source, PacketSource::Broadcast);
    assert!(matches!(
        pleb.recv(Some(Duration::from_millis(200))).await,
        Err(ClientError::RecvTimeout)
    ));

    vip.close().await;
    pleb.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_rate_limit_five_of_seven() {
    let rpc = RpcRegistry::new(16);
    rpc.register_with(
        "throttled",
        |_conn, _args, _kwargs| async move { Ok(json!("ok")) },
        MethodOptions::new().rate_limit(RateLimit::new(5, "1s").unwrap()),
    )
    .unwrap();

    let (server, url) = start(local_config(), DefaultHandler, rpc).await;
    let client = connect(&url).await;

    let mut ok = 0;
    let mut limited = 0;
    for _ in 0..7 {
        let packet = client.send_rpc("throttled", vec![]).await.unwrap();
        match packet.rpc_response().unwrap().error {
            None => ok += 1,
            Some(RpcErrorCode::RateLimited) => limited += 1,
            Some(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(ok, 5);
    assert_eq!(limited, 2);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_rate_limit_disconnect_policy() {
    let rpc = RpcRegistry::new(16);
    rpc.register_with(
        "strict",
        |_conn, _args, _kwargs| async move { Ok(json!("ok")) },
        MethodOptions::new().rate_limit(RateLimit::new(1, "1m").unwrap().disconnect_on_exceed()),
    )
    .unwrap();

    let (server, url) = start(local_config(), DefaultHandler, rpc).await;
    let client = connect(&url).await;

    client.send_rpc("strict", vec![]).await.unwrap();

    // Opting in turns the rate-limit response into a typed error.
    let result = client
        .send_rpc_with(
            "strict",
            vec![],
            Default::default(),
            RpcCallOptions::default().raise_on_rate_limit(),
        )
        .await;
    assert!(matches!(result, Err(ClientError::RateLimited)));

    // The server closed the offender with a policy-violation frame.
    let disconnected = client.recv(Some(Duration::from_secs(2))).await;
    assert!(matches!(disconnected, Err(ClientError::ConnectionClosed)));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_disconnect_cleans_registry() {
    let (server, url) = start(local_config(), DefaultHandler, pubsub_registry()).await;
    let client = connect(&url).await;
    client.send_rpc("join", vec![json!("r1")]).await.unwrap();
    client.send_rpc("join", vec![json!("r2")]).await.unwrap();

    let registry = server.registry();
    assert!(registry.has_channel("r1"));
    assert!(registry.has_channel("r2"));

    client.close().await;

    let mut cleaned = false;
    for _ in 0..100 {
        if registry.client_count() == 0 {
            cleaned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cleaned, "connection was not removed after disconnect");
    assert!(!registry.has_channel("r1"));
    assert!(!registry.has_channel("r2"));
    assert_eq!(registry.channel_count(), 0);

    server.close().await;
}

#[tokio::test]
async fn test_admission_refusal_over_cap() {
    let (server, url) = start(
        local_config().with_max_connections(1),
        DefaultHandler,
        RpcRegistry::new(16),
    )
    .await;

    let first = connect(&url).await;

    // The second handshake completes, then the server sends a
    // try-again-later close.
    let second = connect(&url).await;
    let refused = second.recv(Some(Duration::from_secs(2))).await;
    assert!(matches!(refused, Err(ClientError::ConnectionClosed)));
    assert_eq!(server.registry().client_count(), 1);

    first.close().await;
    second.close().await;
    server.close().await;
}

struct GreetingHandler;

#[async_trait]
impl Handler for GreetingHandler {
    async fn on_connect(&self, conn: &Arc<Connection>) -> Result<(), ServerError> {
        conn.send("I just joined!").await
    }

    async fn on_receive(
        &self,
        conn: &Arc<Connection>,
        packet: wsrelay_protocol::Packet,
    ) -> Result<(), ServerError> {
        if let Some(text) = packet.data.as_ref().and_then(|d| d.as_str()) {
            conn.send(format!("Echo: {}", text)).await?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_handler_callbacks() {
    let (server, url) = start(local_config(), GreetingHandler, RpcRegistry::new(16)).await;
    let client = connect(&url).await;

    let greeting = client.recv(Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(greeting.data.unwrap().as_str().unwrap(), "I just joined!");
    assert_eq!(greeting.source, PacketSource::Server);

    client.send("Hello World!").unwrap();
    let echoed = client.recv(Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(echoed.data.unwrap().as_str().unwrap(), "Echo: Hello World!");

    client.close().await;
    server.close().await;
}

struct ByteEchoHandler;

#[async_trait]
impl Handler for ByteEchoHandler {
    async fn on_receive(
        &self,
        conn: &Arc<Connection>,
        packet: wsrelay_protocol::Packet,
    ) -> Result<(), ServerError> {
        if let Some(data) = packet.data {
            conn.send(data).await?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_binary_wire_format() {
    let rpc = RpcRegistry::new(16);
    rpc.register("add", |_conn, args, _kwargs| async move {
        let a = args.first().and_then(Value::as_i64).unwrap_or_default();
        let b = args.get(1).and_then(Value::as_i64).unwrap_or_default();
        Ok(json!(a + b))
    })
    .unwrap();

    let (server, url) = start(
        local_config().with_wire_format(WireFormat::Binary),
        ByteEchoHandler,
        rpc,
    )
    .await;

    let client = Client::new(ClientConfig::new(&url).with_wire_format(WireFormat::Binary));
    client.connect(ConnectOptions::default()).await.unwrap();

    // RPC over the binary codec.
    let packet = client
        .send_rpc("add", vec![json!(7), json!(35)])
        .await
        .unwrap();
    assert_eq!(packet.rpc_response().unwrap().response, json!(42));

    // Raw bytes survive without a base64 detour.
    let payload = vec![0u8, 159, 146, 150, 255];
    client.send(payload.clone()).unwrap();
    let echoed = client.recv(Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(echoed.data.unwrap().as_bytes().unwrap(), &payload[..]);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_server_close_disconnects_clients() {
    let (server, url) = start(local_config(), DefaultHandler, RpcRegistry::new(16)).await;
    let client = connect(&url).await;

    server.close().await;

    let result = client.recv(Some(Duration::from_secs(2))).await;
    assert!(matches!(result, Err(ClientError::ConnectionClosed)));

    client.close().await;
}

#[tokio::test]
async fn test_rpc_timeout_on_slow_handler() {
    let rpc = RpcRegistry::new(16);
    rpc.register("sleepy", |_conn, _args, _kwargs| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(json!("too late"))
    })
    .unwrap();

    let (server, url) = start(local_config(), DefaultHandler, rpc).await;
    let client = connect(&url).await;

    let result = client
        .send_rpc_with(
            "sleepy",
            vec![],
            Default::default(),
            RpcCallOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await;
    assert!(matches!(result, Err(ClientError::RpcTimeout)));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_runtime_rpc_registration() {
    let rpc = RpcRegistry::new(16);
    rpc.register("install_greet", |conn, _args, _kwargs| async move {
        conn.rpc_methods()
            .register("greet", |_conn, args, _kwargs| async move {
                let name = args.first().and_then(Value::as_str).unwrap_or("world");
                Ok(json!(format!("hello {name}")))
            })
            .map_err(|e| RpcError::internal(e.to_string()))?;
        Ok(json!(true))
    })
    .unwrap();

    let (server, url) = start(local_config(), DefaultHandler, rpc).await;
    let client = connect(&url).await;

    // Not registered yet.
    let packet = client.send_rpc("greet", vec![]).await.unwrap();
    assert_eq!(
        packet.rpc_response().unwrap().error,
        Some(RpcErrorCode::MethodNotFound)
    );

    client.send_rpc("install_greet", vec![]).await.unwrap();

    let packet = client.send_rpc("greet", vec![json!("alice")]).await.unwrap();
    let response = packet.rpc_response().unwrap();
    assert!(response.error.is_none());
    assert_eq!(response.response, json!("hello alice"));

    // Installing twice is a duplicate-alias error, reported inline.
    let packet = client.send_rpc("install_greet", vec![]).await.unwrap();
    assert_eq!(
        packet.rpc_response().unwrap().error,
        Some(RpcErrorCode::InternalError)
    );

    client.close().await;
    server.close().await;
}
