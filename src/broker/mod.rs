// Copyright (c) 2025 - Cowboy AI, Inc.
//! Broker capability set
//!
//! The transport treats the log broker as an external collaborator with a
//! fixed set of capabilities: connect, publish, subscribe, manage durable
//! topic logs and consumers, and deliver acknowledgeable messages. This
//! module defines that capability set as traits so the transport core never
//! touches a concrete client:
//!
//! - [`Connector`] establishes a connection and yields a [`Broker`]
//! - [`Broker`] publishes, subscribes, provisions logs/consumers and fetches
//! - [`Delivery`] is one fetched message awaiting its terminal resolution
//!
//! Two implementations ship with the crate:
//!
//! - [`nats::NatsConnector`] / [`nats::NatsBroker`] on NATS JetStream
//! - [`memory::InMemoryBroker`] in process, for tests and local development
//!
//! # Resolution
//!
//! Every fetched message must be resolved exactly once with ack, nak or term.
//! [`Delivery::resolve`] consumes the delivery, so resolving twice does not
//! compile.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{ConsumerSettings, LogSettings, StorageType};
use crate::errors::TransportResult;
use crate::status::StatusBus;

pub mod memory;
pub mod nats;

/// Header carrying the command correlation id
pub const CORRELATION_ID_HEADER: &str = "correlation-id";
/// Header carrying the subject a command reply goes to
pub const REPLY_TO_HEADER: &str = "reply-to";
/// JetStream message id header, used for duplicate suppression
pub const MESSAGE_ID_HEADER: &str = "Nats-Msg-Id";
/// Header carrying the publish timestamp (RFC 3339)
pub const PUBLISHED_AT_HEADER: &str = "published-at";

/// Message headers understood by the transport
///
/// Known headers get typed fields; anything else is kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers for an outgoing message: a fresh message id and the publish time
    pub fn stamped() -> Self {
        Self::new()
            .with_message_id(Uuid::now_v7().to_string())
            .with_header(PUBLISHED_AT_HEADER, Utc::now().to_rfc3339())
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name.into(), value.into());
        self
    }

    /// Set a header by name, routing known names to their typed field
    pub fn insert(&mut self, name: String, value: String) {
        match name.as_str() {
            CORRELATION_ID_HEADER => self.correlation_id = Some(value),
            REPLY_TO_HEADER => self.reply_to = Some(value),
            MESSAGE_ID_HEADER => self.message_id = Some(value),
            _ => {
                self.extra.insert(name, value);
            }
        }
    }

    /// Look up a header by name
    pub fn get(&self, name: &str) -> Option<&str> {
        match name {
            CORRELATION_ID_HEADER => self.correlation_id.as_deref(),
            REPLY_TO_HEADER => self.reply_to.as_deref(),
            MESSAGE_ID_HEADER => self.message_id.as_deref(),
            _ => self.extra.get(name).map(String::as_str),
        }
    }

    /// All headers as name/value pairs
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        let mut pairs = Vec::with_capacity(self.extra.len() + 3);
        if let Some(value) = &self.correlation_id {
            pairs.push((CORRELATION_ID_HEADER, value.as_str()));
        }
        if let Some(value) = &self.reply_to {
            pairs.push((REPLY_TO_HEADER, value.as_str()));
        }
        if let Some(value) = &self.message_id {
            pairs.push((MESSAGE_ID_HEADER, value.as_str()));
        }
        pairs.extend(self.extra.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        pairs
    }

    pub fn is_empty(&self) -> bool {
        self.correlation_id.is_none()
            && self.reply_to.is_none()
            && self.message_id.is_none()
            && self.extra.is_empty()
    }
}

/// A plain (non-log) message received on a core subscription
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub subject: String,
    pub headers: MessageHeaders,
    pub payload: Bytes,
}

/// The three terminal resolutions of a fetched message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Done; remove from the log
    Ack,
    /// Not processed; redeliver, possibly to another instance
    Nak,
    /// Done; never redeliver
    Term,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Ack => write!(f, "ack"),
            Resolution::Nak => write!(f, "nak"),
            Resolution::Term => write!(f, "term"),
        }
    }
}

/// One message fetched from a durable consumer
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Subject the message was published on
    fn subject(&self) -> &str;

    /// Message headers
    fn headers(&self) -> &MessageHeaders;

    /// Raw payload
    fn payload(&self) -> &[u8];

    /// How many times the broker has delivered this message, starting at 1
    fn delivered(&self) -> u64 {
        1
    }

    /// Resolve the message; consumes it so it cannot be resolved twice
    async fn resolve(self: Box<Self>, resolution: Resolution) -> TransportResult<()>;
}

/// Continuous stream of fetched messages
///
/// Ends when the broker interrupts the pull (restart, leadership change);
/// the pull runner then starts a new one.
pub type DeliveryStream = BoxStream<'static, TransportResult<Box<dyn Delivery>>>;

/// Stream of messages on a core subscription
pub type InboundStream = BoxStream<'static, InboundMessage>;

/// Retention policy for topic logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Limits-based retention (based on max_age and max_bytes)
    Limits,
    /// Interest-based retention (messages kept while there are consumers)
    Interest,
    /// Work queue retention (messages deleted after acknowledgment)
    WorkQueue,
}

/// Full definition of a topic log
#[derive(Debug, Clone, PartialEq)]
pub struct LogSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub storage: StorageType,
    pub replicas: usize,
    pub max_age: Duration,
    pub max_bytes: i64,
    pub max_messages: i64,
    pub max_message_size: i32,
    pub duplicate_window: Duration,
}

impl LogSpec {
    /// Work-queue log capturing `subject`, sized by `settings`
    pub fn work_queue(name: impl Into<String>, subject: impl Into<String>, settings: &LogSettings) -> Self {
        Self {
            name: name.into(),
            subjects: vec![subject.into()],
            retention: RetentionPolicy::WorkQueue,
            storage: settings.storage,
            replicas: settings.replicas,
            max_age: settings.max_age,
            max_bytes: settings.max_bytes,
            max_messages: settings.max_messages,
            max_message_size: settings.max_message_size,
            duplicate_window: settings.duplicate_window,
        }
    }
}

/// Broker-reported state of a topic log
#[derive(Debug, Clone, PartialEq)]
pub struct LogInfo {
    pub name: String,
    pub subjects: Vec<String>,
    pub messages: u64,
}

/// Deliver policy for durable consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// Deliver all messages from the log start
    All,
    /// Deliver only new messages
    New,
}

/// Acknowledgment policy for durable consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Messages must be explicitly acknowledged
    Explicit,
    /// Messages are automatically acknowledged
    None,
    /// Acknowledging a message acknowledges all before it
    All,
}

/// Full definition of a durable pull consumer
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSpec {
    pub durable_name: String,
    pub filter_subject: String,
    pub deliver_policy: DeliverPolicy,
    pub ack_policy: AckPolicy,
    pub ack_wait: Duration,
    pub max_deliver: i64,
    pub max_ack_pending: i64,
}

impl ConsumerSpec {
    /// Explicit-ack consumer delivering the whole backlog of `filter_subject`
    pub fn durable(
        durable_name: impl Into<String>,
        filter_subject: impl Into<String>,
        settings: &ConsumerSettings,
    ) -> Self {
        Self {
            durable_name: durable_name.into(),
            filter_subject: filter_subject.into(),
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::Explicit,
            ack_wait: settings.ack_wait,
            max_deliver: settings.max_deliver,
            max_ack_pending: settings.max_ack_pending,
        }
    }
}

/// Broker-reported state of a durable consumer
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    pub log_name: String,
    pub durable_name: String,
    pub filter_subject: String,
    pub pending: u64,
    pub ack_pending: u64,
}

/// Options for a continuous pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Messages requested per pull
    pub batch_size: usize,
    /// How long a pull request stays open on the server
    pub expires: Duration,
}

/// The broker's capability set, once connected
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message without waiting for a log acknowledgment
    async fn publish(
        &self,
        subject: &str,
        headers: &MessageHeaders,
        payload: Bytes,
    ) -> TransportResult<()>;

    /// Subscribe to a plain subject
    async fn subscribe(&self, subject: &str) -> TransportResult<InboundStream>;

    /// Look up a topic log; [`crate::TransportError::LogNotFound`] if absent
    async fn log_info(&self, name: &str) -> TransportResult<LogInfo>;

    /// Create a topic log from its full definition
    async fn create_log(&self, spec: &LogSpec) -> TransportResult<LogInfo>;

    /// Replace the subject list of an existing topic log
    async fn update_log_subjects(&self, name: &str, subjects: &[String]) -> TransportResult<LogInfo>;

    /// Look up a durable consumer; [`crate::TransportError::ConsumerNotFound`] if absent
    async fn consumer_info(&self, log_name: &str, durable_name: &str) -> TransportResult<ConsumerInfo>;

    /// Create a durable consumer
    ///
    /// Creating an identical consumer again returns the existing one. Fails
    /// with [`crate::TransportError::ConsumerExists`] when the name is taken
    /// by a consumer with a different definition.
    async fn create_consumer(&self, log_name: &str, spec: &ConsumerSpec) -> TransportResult<ConsumerInfo>;

    /// Start a continuous pull from a durable consumer
    async fn fetch(
        &self,
        log_name: &str,
        durable_name: &str,
        options: FetchOptions,
    ) -> TransportResult<DeliveryStream>;

    /// Flush pending publishes and stop accepting new work
    async fn drain(&self) -> TransportResult<()>;

    /// Close immediately
    async fn close(&self) -> TransportResult<()>;
}

/// Establishes broker connections
///
/// The connector reports connection lifecycle changes after the initial
/// connect (drops, reconnects, server errors) on the given status bus.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, status: StatusBus) -> TransportResult<Arc<dyn Broker>>;
}

/// NATS-style subject match: `*` matches one token, `>` one or more trailing tokens
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(f), Some(s)) if f == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("orders.command.>", "orders.command.create"));
        assert!(subject_matches("orders.command.>", "orders.command.order.create"));
        assert!(!subject_matches("orders.command.>", "orders.command"));
        assert!(!subject_matches("orders.command.>", "orders.event.created"));
        assert!(subject_matches("orders.*.created", "orders.event.created"));
        assert!(!subject_matches("orders.*.created", "orders.event.order.created"));
        assert!(subject_matches("orders.reply.abc", "orders.reply.abc"));
        assert!(!subject_matches("orders.reply.abc", "orders.reply.abcd"));
    }

    #[test]
    fn test_headers_route_known_names() {
        let mut headers = MessageHeaders::new();
        headers.insert(CORRELATION_ID_HEADER.to_string(), "c-1".to_string());
        headers.insert(REPLY_TO_HEADER.to_string(), "orders.reply.x".to_string());
        headers.insert("tenant".to_string(), "acme".to_string());

        assert_eq!(headers.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(headers.get(REPLY_TO_HEADER), Some("orders.reply.x"));
        assert_eq!(headers.get("tenant"), Some("acme"));
        assert_eq!(headers.pairs().len(), 3);
        assert!(!headers.is_empty());
        assert!(MessageHeaders::new().is_empty());
    }

    #[test]
    fn test_stamped_headers_are_unique() {
        let first = MessageHeaders::stamped();
        let second = MessageHeaders::stamped();
        assert!(first.message_id.is_some());
        assert!(first.get(PUBLISHED_AT_HEADER).is_some());
        assert_ne!(first.message_id, second.message_id);
    }

    #[test]
    fn test_specs_from_settings() {
        let settings = crate::config::KindSettings::commands();
        let log = LogSpec::work_queue("ORDERS_COMMANDS", "orders.command.>", &settings.log);
        assert_eq!(log.retention, RetentionPolicy::WorkQueue);
        assert_eq!(log.subjects, vec!["orders.command.>".to_string()]);

        let consumer = ConsumerSpec::durable("orders-command", "orders.command.>", &settings.consumer);
        assert_eq!(consumer.ack_policy, AckPolicy::Explicit);
        assert_eq!(consumer.deliver_policy, DeliverPolicy::All);
        assert_eq!(consumer.max_deliver, 1);
    }
}
