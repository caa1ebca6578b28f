// Copyright (c) 2025 - Cowboy AI, Inc.
//! Echo Service
//!
//! Runs a transport against NATS JetStream with two handlers:
//!
//! - command `echo`: replies with the payload it received
//! - event `echoed`: logs the event
//!
//! Every `ECHO_INTERVAL_SECS` seconds (default 10) the service also sends an
//! `echo` command to itself and publishes an `echoed` event with the reply.
//!
//! Run with: cargo run --bin cim-transport-echo
//!
//! Prerequisites:
//! 1. NATS server with JetStream enabled (default: localhost:4222, override via NATS_URL)
//! 2. TRANSPORT_SERVICE set to the service name, e.g. `echo`

use anyhow::{Context, Result};
use cim_transport::{
    command_fn, event_fn, HandlerRegistry, HandlerResult, MessageContext, Transport,
    TransportConfig,
};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info, warn};

fn handlers() -> Result<HandlerRegistry> {
    let registry = HandlerRegistry::new()
        .with_command(
            "echo",
            command_fn(|payload: Value, ctx: MessageContext| async move {
                info!(subject = %ctx.subject, "🔁 Echoing command");
                HandlerResult::Ok(json!({ "echo": payload, "delivered": ctx.delivered }))
            }),
        )?
        .with_event(
            "echoed",
            event_fn(|payload: Value, ctx: MessageContext| async move {
                info!(subject = %ctx.subject, "📨 Received echoed event: {}", payload);
                HandlerResult::Ok(Value::Null)
            }),
        )?;

    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("🚀 Starting Echo Service");

    let config = TransportConfig::from_env().context("Failed to load transport configuration")?;
    let interval = std::env::var("ECHO_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(10));

    info!("📋 Configuration loaded:");
    info!("  - Service: {}", config.service);
    info!("  - NATS servers: {:?}", config.servers);
    info!("  - Command timeout: {:?}", config.command_timeout);

    let transport = Transport::nats(config, handlers()?).context("Failed to build transport")?;

    transport
        .start()
        .await
        .context("Failed to start transport")?;
    info!("✅ Transport started");

    let client = transport.client();
    let mut ticker = tokio::time::interval(interval);
    let mut sequence: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                sequence += 1;
                match client.send("echo", &json!({ "sequence": sequence })).await {
                    Ok(reply) => {
                        info!("✅ Reply: {}", reply);
                        if let Err(e) = client.dispatch_event("echoed", &reply).await {
                            warn!("Failed to publish echoed event: {}", e);
                        }
                    }
                    Err(e) => error!("❌ Echo command failed: {}", e),
                }
            }
        }
    }

    transport.close().await.context("Failed to close transport")?;
    info!("👋 Echo Service stopped");
    Ok(())
}
