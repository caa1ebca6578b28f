// Copyright (c) 2025 - Cowboy AI, Inc.
//! Transport configuration
//!
//! Commands and events get deliberately different log and consumer policies:
//!
//! | | commands | events |
//! |---|---|---|
//! | max age | 5 minutes | 7 days |
//! | max bytes | 64 MiB | 1 GiB |
//! | max deliver | 1 | 5 |
//! | max ack pending | 25 | 1000 |
//! | ack wait | 5 minutes | 30 seconds |
//!
//! Commands are bounded RPCs: a single attempt, few in flight, and an ack
//! wait longer than the dispatcher's command timeout so the broker never
//! redelivers a command that is still running. Events are durable fan-out:
//! retried on failure and processed with high concurrency.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{TransportError, TransportResult};
use crate::subjects::{MessageKind, SubjectSpace};

/// Storage type for topic logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    /// File-based storage (persistent across restarts)
    File,
    /// Memory-based storage (faster, but lost on restart)
    Memory,
}

/// Topic log limits for one message kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    /// Maximum age of messages
    pub max_age: Duration,
    /// Maximum bytes stored in the log
    pub max_bytes: i64,
    /// Maximum number of messages stored in the log
    pub max_messages: i64,
    /// Maximum size of a single message
    pub max_message_size: i32,
    /// Storage type
    pub storage: StorageType,
    /// Number of replicas (for clustered NATS)
    pub replicas: usize,
    /// Window in which a repeated message id is dropped
    pub duplicate_window: Duration,
}

/// Durable consumer policy for one message kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// How long the broker waits for an ack before redelivering
    pub ack_wait: Duration,
    /// Maximum delivery attempts per message
    pub max_deliver: i64,
    /// Maximum unacknowledged messages in flight
    pub max_ack_pending: i64,
}

/// Log and consumer settings for one message kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindSettings {
    pub log: LogSettings,
    pub consumer: ConsumerSettings,
}

impl KindSettings {
    /// Defaults for command logs: short-lived, small, single attempt
    pub fn commands() -> Self {
        Self {
            log: LogSettings {
                max_age: Duration::from_secs(5 * 60),
                max_bytes: 64 * 1024 * 1024,
                max_messages: 100_000,
                max_message_size: 1024 * 1024,
                storage: StorageType::File,
                replicas: 1,
                duplicate_window: Duration::from_secs(2 * 60),
            },
            consumer: ConsumerSettings {
                ack_wait: Duration::from_secs(5 * 60),
                max_deliver: 1,
                max_ack_pending: 25,
            },
        }
    }

    /// Defaults for event logs: long-lived, large, retried
    pub fn events() -> Self {
        Self {
            log: LogSettings {
                max_age: Duration::from_secs(7 * 24 * 60 * 60),
                max_bytes: 1024 * 1024 * 1024,
                max_messages: 10_000_000,
                max_message_size: 1024 * 1024,
                storage: StorageType::File,
                replicas: 1,
                duplicate_window: Duration::from_secs(2 * 60),
            },
            consumer: ConsumerSettings {
                ack_wait: Duration::from_secs(30),
                max_deliver: 5,
                max_ack_pending: 1000,
            },
        }
    }
}

/// Pull loop settings shared by both kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSettings {
    /// Messages requested per pull
    pub batch_size: usize,
    /// How long a single pull request stays open on the server
    pub expires: Duration,
    /// Pause before restarting an exhausted or failed pull stream
    pub restart_delay: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            batch_size: 25,
            expires: Duration::from_secs(30),
            restart_delay: Duration::from_secs(1),
        }
    }
}

/// Configuration for a transport instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Service name; the first token of every subject
    pub service: String,
    /// NATS server URLs
    pub servers: Vec<String>,
    /// Client connection name
    pub connection_name: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Event log and consumer settings
    pub events: KindSettings,
    /// Command log and consumer settings
    pub commands: KindSettings,
    /// Pull loop settings
    pub fetch: FetchSettings,
    /// Wall-clock limit for a command handler
    pub command_timeout: Duration,
    /// How long a producer waits for a command reply
    pub reply_timeout: Duration,
    /// Upper bound on concurrently dispatched messages per consumer
    ///
    /// `None` dispatches every fetched message immediately; in-flight work is
    /// then bounded only by the consumer's max ack pending.
    pub max_concurrent_dispatch: Option<usize>,
}

impl TransportConfig {
    /// Create a configuration for a service with default settings
    pub fn new(service: impl Into<String>) -> Self {
        let service = service.into();
        Self {
            connection_name: format!("{}-transport", service),
            service,
            servers: vec!["nats://localhost:4222".to_string()],
            connect_timeout: Duration::from_secs(10),
            events: KindSettings::events(),
            commands: KindSettings::commands(),
            fetch: FetchSettings::default(),
            command_timeout: Duration::from_secs(3 * 60),
            reply_timeout: Duration::from_secs(3 * 60 + 10),
            max_concurrent_dispatch: None,
        }
    }

    /// Set the NATS server URLs
    pub fn with_servers(mut self, servers: Vec<String>) -> Self {
        self.servers = servers;
        self
    }

    /// Set the command handler timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the producer reply timeout
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the pull loop settings
    pub fn with_fetch(mut self, fetch: FetchSettings) -> Self {
        self.fetch = fetch;
        self
    }

    /// Bound the number of messages dispatched concurrently per consumer
    pub fn with_max_concurrent_dispatch(mut self, limit: usize) -> Self {
        self.max_concurrent_dispatch = Some(limit);
        self
    }

    /// Settings for one kind
    pub fn kind(&self, kind: MessageKind) -> &KindSettings {
        match kind {
            MessageKind::Event => &self.events,
            MessageKind::Command => &self.commands,
        }
    }

    /// Mutable settings for one kind
    pub fn kind_mut(&mut self, kind: MessageKind) -> &mut KindSettings {
        match kind {
            MessageKind::Event => &mut self.events,
            MessageKind::Command => &mut self.commands,
        }
    }

    /// Load configuration from environment variables
    ///
    /// - `TRANSPORT_SERVICE` (required)
    /// - `NATS_URL` comma-separated server list (default `nats://localhost:4222`)
    /// - `TRANSPORT_COMMAND_TIMEOUT_SECS`
    /// - `TRANSPORT_REPLY_TIMEOUT_SECS`
    /// - `TRANSPORT_BATCH_SIZE`
    /// - `TRANSPORT_MAX_CONCURRENT_DISPATCH`
    /// - `TRANSPORT_COMMAND_MAX_ACK_PENDING`, `TRANSPORT_EVENT_MAX_ACK_PENDING`
    /// - `TRANSPORT_EVENT_MAX_DELIVER`
    pub fn from_env() -> TransportResult<Self> {
        let service = std::env::var("TRANSPORT_SERVICE").map_err(|_| {
            TransportError::Configuration("TRANSPORT_SERVICE not set".to_string())
        })?;

        let mut config = Self::new(service);

        if let Ok(urls) = std::env::var("NATS_URL") {
            config.servers = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(secs) = env_number::<u64>("TRANSPORT_COMMAND_TIMEOUT_SECS")? {
            config.command_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_number::<u64>("TRANSPORT_REPLY_TIMEOUT_SECS")? {
            config.reply_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = env_number::<usize>("TRANSPORT_BATCH_SIZE")? {
            config.fetch.batch_size = size;
        }
        config.max_concurrent_dispatch =
            env_number::<usize>("TRANSPORT_MAX_CONCURRENT_DISPATCH")?;
        if let Some(pending) = env_number::<i64>("TRANSPORT_COMMAND_MAX_ACK_PENDING")? {
            config.commands.consumer.max_ack_pending = pending;
        }
        if let Some(pending) = env_number::<i64>("TRANSPORT_EVENT_MAX_ACK_PENDING")? {
            config.events.consumer.max_ack_pending = pending;
        }
        if let Some(deliver) = env_number::<i64>("TRANSPORT_EVENT_MAX_DELIVER")? {
            config.events.consumer.max_deliver = deliver;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the broker or the loops cannot use
    pub fn validate(&self) -> TransportResult<()> {
        SubjectSpace::new(self.service.as_str())?;

        if self.servers.is_empty() {
            return Err(TransportError::Configuration(
                "at least one NATS server is required".to_string(),
            ));
        }
        if self.fetch.batch_size == 0 {
            return Err(TransportError::Configuration(
                "fetch batch size must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_dispatch == Some(0) {
            return Err(TransportError::Configuration(
                "max concurrent dispatch must be at least 1".to_string(),
            ));
        }
        if self.commands.consumer.ack_wait <= self.command_timeout {
            return Err(TransportError::Configuration(format!(
                "command ack wait ({:?}) must exceed the command timeout ({:?})",
                self.commands.consumer.ack_wait, self.command_timeout
            )));
        }

        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> TransportResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| TransportError::Configuration(format!("{} is not a valid number: {}", key, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransportConfig::new("orders");
        assert_eq!(config.service, "orders");
        assert_eq!(config.servers, vec!["nats://localhost:4222"]);
        assert_eq!(config.connection_name, "orders-transport");
        assert_eq!(config.command_timeout, Duration::from_secs(180));
        assert_eq!(config.fetch.batch_size, 25);
        assert_eq!(config.max_concurrent_dispatch, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_command_and_event_policies_differ() {
        let commands = KindSettings::commands();
        let events = KindSettings::events();

        assert_eq!(commands.consumer.max_deliver, 1);
        assert!(events.consumer.max_deliver > 1);
        assert!(commands.consumer.max_ack_pending < events.consumer.max_ack_pending);
        assert!(commands.consumer.ack_wait > events.consumer.ack_wait);
        assert!(commands.log.max_age < events.log.max_age);
        assert!(commands.log.max_bytes < events.log.max_bytes);
    }

    #[test]
    fn test_validate_rejects_short_command_ack_wait() {
        let config = TransportConfig::new("orders").with_command_timeout(Duration::from_secs(600));
        assert!(matches!(
            config.validate(),
            Err(TransportError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(TransportConfig::new("orders.v2").validate().is_err());
        assert!(TransportConfig::new("orders").with_servers(vec![]).validate().is_err());
        assert!(TransportConfig::new("orders")
            .with_max_concurrent_dispatch(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = TransportConfig::new("orders").with_max_concurrent_dispatch(8);
        let json = serde_json::to_string(&config).unwrap();
        let decoded: TransportConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, decoded);
    }
}
