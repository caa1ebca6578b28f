// Copyright (c) 2025 - Cowboy AI, Inc.
//! Error types for transport operations

use thiserror::Error;

/// Errors that can occur in transport operations
///
/// Every payload is a plain string so that errors can be cloned. A failed
/// connection attempt is cached and handed to every later waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// NATS connection error
    #[error("NATS connection error: {0}")]
    NatsConnection(String),

    /// NATS publish error
    #[error("NATS publish error: {0}")]
    NatsPublish(String),

    /// NATS subscribe error
    #[error("NATS subscribe error: {0}")]
    NatsSubscribe(String),

    /// Topic log does not exist on the broker
    #[error("Topic log not found: {0}")]
    LogNotFound(String),

    /// Durable consumer does not exist on the broker
    #[error("Durable consumer not found: {0}")]
    ConsumerNotFound(String),

    /// Durable consumer was created concurrently by another instance
    #[error("Durable consumer already exists: {0}")]
    ConsumerExists(String),

    /// Any other log or consumer management failure
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// Pulling messages from a durable consumer failed
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Acknowledging a fetched message failed
    #[error("Acknowledgment error: {0}")]
    Acknowledgment(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The connection is not in a ready state
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// The transport was closed
    #[error("Transport closed")]
    Closed,

    /// An application handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// A handler was registered twice for the same kind and pattern
    #[error("Duplicate handler for {kind} pattern '{pattern}'")]
    DuplicateHandler { kind: String, pattern: String },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

impl From<async_nats::Error> for TransportError {
    fn from(err: async_nats::Error) -> Self {
        TransportError::NatsConnection(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}

impl TransportError {
    /// Whether the error is a connectivity problem rather than a logic error
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            TransportError::NatsConnection(_)
                | TransportError::Unavailable(_)
                | TransportError::Closed
        )
    }
}
