//! wsrelay - standalone relay server.
//!
//! Runs the framework as a plain message relay: clients join channels and
//! publish through built-in RPC methods.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wsrelay_server::{
    create_tls_acceptor, Config, DefaultHandler, RpcError, RpcRegistry, Server, ServerConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("starting wsrelay server");
    tracing::info!("  bind address: {}", config.network.bind_addr);
    tracing::info!("  wire format: {:?}", config.network.wire_format);

    let mut server_config = ServerConfig::from_config(&config);
    if config.tls.enabled {
        let acceptor = create_tls_acceptor(&config.tls)?;
        server_config = server_config.with_tls(acceptor);
        tracing::info!("  TLS enabled");
    }

    let rpc = RpcRegistry::new(config.limits.rpc_task_limit);

    rpc.register("join", |conn, args, _kwargs| async move {
        let channel = channel_arg(&args)?;
        conn.subscribe(channel);
        Ok(json!(true))
    })?;

    rpc.register("leave", |conn, args, _kwargs| async move {
        let channel = channel_arg(&args)?;
        conn.unsubscribe(channel);
        Ok(json!(true))
    })?;

    rpc.register("publish", |conn, args, _kwargs| async move {
        let channel = channel_arg(&args)?;
        let message = args
            .get(1)
            .cloned()
            .ok_or_else(|| RpcError::invalid_arguments("publish(channel, message)"))?;
        let delivered = conn
            .registry()
            .publish(channel, message, &HashSet::from([conn.id()]), None)
            .await
            .map_err(|e| RpcError::internal(e.to_string()))?;
        Ok(json!(delivered))
    })?;

    let server = Arc::new(Server::new(server_config, DefaultHandler, rpc));
    server.start().await?;

    let shutdown = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.close().await;
        }
    });

    server.serve_forever().await?;
    Ok(())
}

fn channel_arg(args: &[Value]) -> Result<String, RpcError> {
    args.first()
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::invalid_arguments("expected a channel name as first argument"))
}
