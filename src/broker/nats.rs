// Copyright (c) 2025 - Cowboy AI, Inc.
//! NATS JetStream broker
//!
//! Implements the broker capability set on `async-nats`:
//!
//! - **Topic logs** are JetStream streams
//! - **Durable consumers** are JetStream pull consumers
//! - **Replies** travel over core NATS subjects
//!
//! Connection lifecycle changes after the initial connect (drops, reconnects,
//! server errors) are forwarded to the transport's status bus from the client
//! event callback.
//!
//! # Example
//!
//! ```rust,no_run
//! use cim_transport::broker::nats::{NatsConfig, NatsConnector};
//! use cim_transport::broker::Connector;
//! use cim_transport::status::StatusBus;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connector = NatsConnector::new(NatsConfig::default());
//!     let broker = connector.connect(StatusBus::new()).await?;
//!     let info = broker.log_info("ORDERS_EVENTS").await;
//!     println!("{:?}", info);
//!     Ok(())
//! }
//! ```

use async_nats::jetstream::{self, consumer::pull, AckKind};
use async_nats::{Client, ConnectOptions, Event, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    AckPolicy, Broker, ConsumerInfo, ConsumerSpec, Connector, DeliverPolicy, Delivery,
    DeliveryStream, FetchOptions, InboundMessage, InboundStream, LogInfo, LogSpec,
    MessageHeaders, Resolution, RetentionPolicy,
};
use crate::config::{StorageType, TransportConfig};
use crate::errors::{TransportError, TransportResult};
use crate::status::{StatusBus, StatusEvent};

/// Configuration for NATS connection
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URLs
    pub servers: Vec<String>,
    /// Client name
    pub name: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Request timeout for JetStream management calls
    pub request_timeout: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            name: "cim-transport".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&TransportConfig> for NatsConfig {
    fn from(config: &TransportConfig) -> Self {
        Self {
            servers: config.servers.clone(),
            name: config.connection_name.clone(),
            connect_timeout: config.connect_timeout,
            ..Default::default()
        }
    }
}

/// Connects to NATS and attaches a JetStream context
pub struct NatsConnector {
    config: NatsConfig,
}

impl NatsConnector {
    pub fn new(config: NatsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self, status: StatusBus) -> TransportResult<Arc<dyn Broker>> {
        // Connected events before the initial connect returns are ours to report
        let established = Arc::new(AtomicBool::new(false));
        let callback_established = Arc::clone(&established);

        let connect_options = ConnectOptions::new()
            .name(&self.config.name)
            .connection_timeout(self.config.connect_timeout)
            .request_timeout(Some(self.config.request_timeout))
            .event_callback(move |event| {
                let status = status.clone();
                let established = Arc::clone(&callback_established);
                async move {
                    match event {
                        Event::Connected => {
                            if established.load(Ordering::SeqCst) {
                                status.emit(StatusEvent::Reconnected);
                            }
                        }
                        Event::Disconnected => status.emit(StatusEvent::Disconnected),
                        other => status.emit(StatusEvent::Error(other.to_string())),
                    }
                }
            });

        let client = async_nats::connect_with_options(self.config.servers.join(","), connect_options)
            .await
            .map_err(|e| TransportError::NatsConnection(e.to_string()))?;
        established.store(true, Ordering::SeqCst);

        info!("Connected to NATS at {:?}", self.config.servers);

        Ok(Arc::new(NatsBroker::new(client)))
    }
}

/// Broker backed by a NATS client and its JetStream context
pub struct NatsBroker {
    client: Client,
    jetstream: jetstream::Context,
    shutdown: CancellationToken,
}

impl NatsBroker {
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the underlying NATS client for advanced operations
    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.shutdown.is_cancelled() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn stream(&self, name: &str) -> TransportResult<jetstream::stream::Stream> {
        self.jetstream
            .get_stream(name)
            .await
            .map_err(|e| classify_log_error(name, e))
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(
        &self,
        subject: &str,
        headers: &MessageHeaders,
        payload: Bytes,
    ) -> TransportResult<()> {
        self.ensure_open()?;

        self.client
            .publish_with_headers(subject.to_string(), to_header_map(headers), payload)
            .await
            .map_err(|e| TransportError::NatsPublish(e.to_string()))?;

        debug!("Published message to subject: {}", subject);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> TransportResult<InboundStream> {
        self.ensure_open()?;

        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| TransportError::NatsSubscribe(e.to_string()))?;

        info!("Subscribed to subject: {}", subject);

        Ok(subscriber
            .map(|message| InboundMessage {
                subject: message.subject.to_string(),
                headers: from_header_map(message.headers.as_ref()),
                payload: message.payload,
            })
            .take_until(self.shutdown.clone().cancelled_owned())
            .boxed())
    }

    async fn log_info(&self, name: &str) -> TransportResult<LogInfo> {
        self.ensure_open()?;
        let stream = self.stream(name).await?;
        let info = stream.cached_info();

        Ok(LogInfo {
            name: info.config.name.clone(),
            subjects: info.config.subjects.clone(),
            messages: info.state.messages,
        })
    }

    async fn create_log(&self, spec: &LogSpec) -> TransportResult<LogInfo> {
        self.ensure_open()?;

        let stream = self
            .jetstream
            .create_stream(to_stream_config(spec))
            .await
            .map_err(|e| TransportError::Provisioning(e.to_string()))?;
        let info = stream.cached_info();

        Ok(LogInfo {
            name: info.config.name.clone(),
            subjects: info.config.subjects.clone(),
            messages: info.state.messages,
        })
    }

    async fn update_log_subjects(&self, name: &str, subjects: &[String]) -> TransportResult<LogInfo> {
        self.ensure_open()?;

        let stream = self.stream(name).await?;
        let mut config = stream.cached_info().config.clone();
        config.subjects = subjects.to_vec();

        let info = self
            .jetstream
            .update_stream(&config)
            .await
            .map_err(|e| classify_log_error(name, e))?;

        Ok(LogInfo {
            name: info.config.name.clone(),
            subjects: info.config.subjects.clone(),
            messages: info.state.messages,
        })
    }

    async fn consumer_info(&self, log_name: &str, durable_name: &str) -> TransportResult<ConsumerInfo> {
        self.ensure_open()?;

        let stream = self.stream(log_name).await?;
        let info = stream
            .consumer_info(durable_name)
            .await
            .map_err(|e| classify_consumer_error(durable_name, e))?;

        Ok(ConsumerInfo {
            log_name: log_name.to_string(),
            durable_name: durable_name.to_string(),
            filter_subject: info.config.filter_subject.clone(),
            pending: info.num_pending,
            ack_pending: info.num_ack_pending as u64,
        })
    }

    async fn create_consumer(&self, log_name: &str, spec: &ConsumerSpec) -> TransportResult<ConsumerInfo> {
        self.ensure_open()?;

        let stream = self.stream(log_name).await?;
        stream
            .create_consumer(to_consumer_config(spec))
            .await
            .map_err(|e| classify_consumer_error(&spec.durable_name, e))?;

        self.consumer_info(log_name, &spec.durable_name).await
    }

    async fn fetch(
        &self,
        log_name: &str,
        durable_name: &str,
        options: FetchOptions,
    ) -> TransportResult<DeliveryStream> {
        self.ensure_open()?;

        let stream = self.stream(log_name).await?;
        let consumer: jetstream::consumer::Consumer<pull::Config> = stream
            .get_consumer(durable_name)
            .await
            .map_err(|e| classify_consumer_error(durable_name, e))?;

        let messages = consumer
            .stream()
            .max_messages_per_batch(options.batch_size)
            .expires(options.expires)
            .messages()
            .await
            .map_err(|e| TransportError::Fetch(e.to_string()))?;

        Ok(messages
            .map(|message| {
                message
                    .map(|message| Box::new(NatsDelivery::new(message)) as Box<dyn Delivery>)
                    .map_err(|e| TransportError::Fetch(e.to_string()))
            })
            .take_until(self.shutdown.clone().cancelled_owned())
            .boxed())
    }

    async fn drain(&self) -> TransportResult<()> {
        self.shutdown.cancel();
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::NatsConnection(e.to_string()))
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.shutdown.is_cancelled() {
            warn!("Closing NATS broker without draining");
        }
        self.shutdown.cancel();
        Ok(())
    }
}

/// A message fetched from a JetStream pull consumer
pub struct NatsDelivery {
    message: jetstream::Message,
    subject: String,
    headers: MessageHeaders,
}

impl NatsDelivery {
    fn new(message: jetstream::Message) -> Self {
        let subject = message.subject.to_string();
        let headers = from_header_map(message.headers.as_ref());
        Self {
            message,
            subject,
            headers,
        }
    }
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn delivered(&self) -> u64 {
        self.message
            .info()
            .map(|info| info.delivered.max(1) as u64)
            .unwrap_or(1)
    }

    async fn resolve(self: Box<Self>, resolution: Resolution) -> TransportResult<()> {
        let result = match resolution {
            Resolution::Ack => self.message.ack().await,
            Resolution::Nak => self.message.ack_with(AckKind::Nak(None)).await,
            Resolution::Term => self.message.ack_with(AckKind::Term).await,
        };

        result.map_err(|e| TransportError::Acknowledgment(format!("{} failed: {}", resolution, e)))
    }
}

fn to_header_map(headers: &MessageHeaders) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers.pairs() {
        map.insert(name, value);
    }
    map
}

/// Every header is kept; for repeated names the first value wins
fn from_header_map(map: Option<&HeaderMap>) -> MessageHeaders {
    let mut headers = MessageHeaders::new();
    for (name, values) in map.into_iter().flat_map(|map| map.iter()) {
        if let Some(value) = values.first() {
            headers.insert(name.to_string(), value.as_str().to_string());
        }
    }
    headers
}

fn to_stream_config(spec: &LogSpec) -> jetstream::stream::Config {
    let storage = match spec.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let retention = match spec.retention {
        RetentionPolicy::Limits => jetstream::stream::RetentionPolicy::Limits,
        RetentionPolicy::Interest => jetstream::stream::RetentionPolicy::Interest,
        RetentionPolicy::WorkQueue => jetstream::stream::RetentionPolicy::WorkQueue,
    };

    jetstream::stream::Config {
        name: spec.name.clone(),
        subjects: spec.subjects.clone(),
        retention,
        storage,
        num_replicas: spec.replicas,
        max_age: spec.max_age,
        max_bytes: spec.max_bytes,
        max_messages: spec.max_messages,
        max_message_size: spec.max_message_size,
        duplicate_window: spec.duplicate_window,
        ..Default::default()
    }
}

fn to_consumer_config(spec: &ConsumerSpec) -> pull::Config {
    let deliver_policy = match spec.deliver_policy {
        DeliverPolicy::All => jetstream::consumer::DeliverPolicy::All,
        DeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
    };

    let ack_policy = match spec.ack_policy {
        AckPolicy::Explicit => jetstream::consumer::AckPolicy::Explicit,
        AckPolicy::None => jetstream::consumer::AckPolicy::None,
        AckPolicy::All => jetstream::consumer::AckPolicy::All,
    };

    pull::Config {
        durable_name: Some(spec.durable_name.clone()),
        filter_subject: spec.filter_subject.clone(),
        deliver_policy,
        ack_policy,
        ack_wait: spec.ack_wait,
        max_deliver: spec.max_deliver,
        max_ack_pending: spec.max_ack_pending,
        ..Default::default()
    }
}

/// JetStream reports "not found" as API error code 10059
fn classify_log_error(name: &str, err: impl std::fmt::Display) -> TransportError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("10059") || lower.contains("stream not found") {
        TransportError::LogNotFound(name.to_string())
    } else {
        TransportError::Provisioning(message)
    }
}

/// Consumer "not found" is 10014; name collisions are 10013 and 10148
fn classify_consumer_error(durable_name: &str, err: impl std::fmt::Display) -> TransportError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("10014") || lower.contains("consumer not found") {
        TransportError::ConsumerNotFound(durable_name.to_string())
    } else if lower.contains("10013") || lower.contains("10148") || lower.contains("already") {
        TransportError::ConsumerExists(durable_name.to_string())
    } else {
        TransportError::Provisioning(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PUBLISHED_AT_HEADER;
    use crate::config::KindSettings;

    #[test]
    fn test_default_config() {
        let config = NatsConfig::default();
        assert_eq!(config.servers, vec!["nats://localhost:4222"]);
        assert_eq!(config.name, "cim-transport");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_headers_survive_conversion() {
        let sent = MessageHeaders::stamped()
            .with_correlation_id("c-1")
            .with_reply_to("orders.reply.abc")
            .with_header("traceparent", "00-abc-def-01")
            .with_header("tenant-id", "acme");

        let received = from_header_map(Some(&to_header_map(&sent)));

        assert_eq!(received, sent);
        assert_eq!(received.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(received.get("tenant-id"), Some("acme"));
        assert!(received.get(PUBLISHED_AT_HEADER).is_some());
    }

    #[test]
    fn test_missing_header_map() {
        assert_eq!(from_header_map(None), MessageHeaders::new());
    }

    #[test]
    fn test_config_from_transport_config() {
        let transport = TransportConfig::new("orders")
            .with_servers(vec!["nats://10.0.20.1:4222".into(), "nats://10.0.20.2:4222".into()]);
        let config = NatsConfig::from(&transport);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.name, "orders-transport");
    }

    #[test]
    fn test_stream_config_mapping() {
        let settings = KindSettings::commands();
        let spec = LogSpec::work_queue("ORDERS_COMMANDS", "orders.command.>", &settings.log);
        let config = to_stream_config(&spec);

        assert_eq!(config.name, "ORDERS_COMMANDS");
        assert_eq!(config.subjects, vec!["orders.command.>".to_string()]);
        assert_eq!(config.retention, jetstream::stream::RetentionPolicy::WorkQueue);
        assert_eq!(config.max_age, settings.log.max_age);
    }

    #[test]
    fn test_consumer_config_mapping() {
        let settings = KindSettings::events();
        let spec = ConsumerSpec::durable("orders-event", "orders.event.>", &settings.consumer);
        let config = to_consumer_config(&spec);

        assert_eq!(config.durable_name.as_deref(), Some("orders-event"));
        assert_eq!(config.filter_subject, "orders.event.>");
        assert_eq!(config.max_deliver, 5);
        assert_eq!(config.ack_policy, jetstream::consumer::AckPolicy::Explicit);
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            classify_log_error("ORDERS_EVENTS", "jetstream error: stream not found (code 404, error code 10059)"),
            TransportError::LogNotFound("ORDERS_EVENTS".into())
        );
        assert_eq!(
            classify_consumer_error("orders-event", "jetstream error: consumer not found (code 404, error code 10014)"),
            TransportError::ConsumerNotFound("orders-event".into())
        );
        assert_eq!(
            classify_consumer_error("orders-event", "jetstream error: consumer already exists (code 400, error code 10148)"),
            TransportError::ConsumerExists("orders-event".into())
        );
        assert!(matches!(
            classify_consumer_error("orders-event", "insufficient resources"),
            TransportError::Provisioning(_)
        ));
    }

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_provisioning_roundtrip() -> TransportResult<()> {
        let connector = NatsConnector::new(NatsConfig::default());
        let broker = connector.connect(StatusBus::new()).await?;

        let settings = KindSettings::events();
        let spec = LogSpec::work_queue("CIM_TRANSPORT_TEST_EVENTS", "cim-transport-test.event.>", &settings.log);
        match broker.log_info(&spec.name).await {
            Ok(_) => {}
            Err(TransportError::LogNotFound(_)) => {
                broker.create_log(&spec).await?;
            }
            Err(e) => return Err(e),
        }

        let info = broker.log_info(&spec.name).await?;
        assert_eq!(info.subjects, spec.subjects);
        Ok(())
    }
}
