// Copyright (c) 2025 - Cowboy AI, Inc.
//! Test Fixtures for cim-transport
//!
//! Builds transports on the in-memory broker with fast pull timings, and
//! publishes raw messages the way a remote producer would.
#![allow(dead_code)]

use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use cim_transport::broker::{Broker, MessageHeaders};
use cim_transport::{
    FetchSettings, HandlerRegistry, InMemoryBroker, InMemoryConnector, Transport, TransportConfig,
};

pub const SERVICE: &str = "orders";
pub const REPLY_SUBJECT: &str = "orders.reply.fixture";
pub const CORRELATION_ID_1: &str = "01934f4a-c001-7000-8000-00000000c001";
pub const CORRELATION_ID_2: &str = "01934f4a-c002-7000-8000-00000000c002";

/// Generous bound for anything the tests wait on
pub const WAIT: Duration = Duration::from_secs(5);

/// Configuration with pull timings suited to tests
pub fn test_config() -> TransportConfig {
    TransportConfig::new(SERVICE).with_fetch(FetchSettings {
        batch_size: 25,
        expires: Duration::from_secs(1),
        restart_delay: Duration::from_millis(20),
    })
}

/// A transport on `broker` plus the connector backing it
pub fn transport_with(
    broker: &InMemoryBroker,
    config: TransportConfig,
    handlers: HandlerRegistry,
) -> (Transport, Arc<InMemoryConnector>) {
    let connector = Arc::new(InMemoryConnector::new(broker.clone()));
    let transport = Transport::new(config, connector.clone(), handlers)
        .expect("valid transport configuration");
    (transport, connector)
}

/// Start a transport with the test configuration
pub async fn started(broker: &InMemoryBroker, handlers: HandlerRegistry) -> Transport {
    let (transport, _) = transport_with(broker, test_config(), handlers);
    transport.start().await.expect("transport starts");
    transport
}

/// Publish raw bytes from a separate session
pub async fn publish_raw(broker: &InMemoryBroker, subject: &str, headers: MessageHeaders, payload: &[u8]) {
    broker
        .session()
        .publish(subject, &headers, Bytes::copy_from_slice(payload))
        .await
        .expect("raw publish");
}

/// Publish a command the way a remote producer would
pub async fn publish_command(broker: &InMemoryBroker, pattern: &str, correlation_id: &str, payload: &Value) {
    let headers = MessageHeaders::new()
        .with_correlation_id(correlation_id)
        .with_reply_to(REPLY_SUBJECT);
    let body = serde_json::to_vec(payload).expect("encode payload");
    publish_raw(broker, &format!("{}.command.{}", SERVICE, pattern), headers, &body).await;
}

/// Publish an event the way a remote producer would
pub async fn publish_event(broker: &InMemoryBroker, pattern: &str, payload: &Value) {
    let body = serde_json::to_vec(payload).expect("encode payload");
    publish_raw(
        broker,
        &format!("{}.event.{}", SERVICE, pattern),
        MessageHeaders::new(),
        &body,
    )
    .await;
}

/// Replies published on the fixture reply subject, decoded
pub fn replies(broker: &InMemoryBroker) -> Vec<(Option<String>, Value)> {
    broker
        .published_on(REPLY_SUBJECT)
        .into_iter()
        .map(|message| {
            let body = message.json().expect("reply is JSON");
            (message.headers.correlation_id, body)
        })
        .collect()
}
