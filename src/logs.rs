// Copyright (c) 2025 - Cowboy AI, Inc.
//! Topic log management
//!
//! Each service owns two work-queue logs, one per message kind, named and
//! filtered deterministically from the service name. `ensure` converges to
//! the same steady state however often and in whatever order it runs:
//!
//! - log present: refresh its subject list
//! - log absent: create it from the kind's full settings

use std::sync::Arc;

use tracing::{debug, info};

use crate::broker::{Broker, LogInfo, LogSpec};
use crate::config::TransportConfig;
use crate::errors::{TransportError, TransportResult};
use crate::subjects::{MessageKind, SubjectSpace};

/// Ensures the topic logs of one service exist with the right policies
#[derive(Clone)]
pub struct TopicLogManager {
    broker: Arc<dyn Broker>,
    subjects: SubjectSpace,
    config: Arc<TransportConfig>,
}

impl TopicLogManager {
    pub fn new(broker: Arc<dyn Broker>, subjects: SubjectSpace, config: Arc<TransportConfig>) -> Self {
        Self {
            broker,
            subjects,
            config,
        }
    }

    /// Full log definition for a kind
    pub fn spec(&self, kind: MessageKind) -> LogSpec {
        LogSpec::work_queue(
            self.subjects.log_name(kind),
            self.subjects.filter(kind),
            &self.config.kind(kind).log,
        )
    }

    /// Make sure the log for `kind` exists and captures the kind's subjects
    pub async fn ensure(&self, kind: MessageKind) -> TransportResult<LogInfo> {
        let spec = self.spec(kind);

        match self.broker.log_info(&spec.name).await {
            Ok(_) => {
                debug!(stream = %spec.name, %kind, "Topic log exists, updating subjects");
                self.broker
                    .update_log_subjects(&spec.name, &spec.subjects)
                    .await
            }
            Err(TransportError::LogNotFound(_)) => {
                info!(stream = %spec.name, %kind, subjects = ?spec.subjects, "Creating topic log");
                self.broker.create_log(&spec).await
            }
            Err(err) => Err(err),
        }
    }

    /// Ensure both logs concurrently; any failure fails the whole step
    pub async fn ensure_all(&self) -> TransportResult<(LogInfo, LogInfo)> {
        futures::try_join!(
            self.ensure(MessageKind::Event),
            self.ensure(MessageKind::Command)
        )
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn subjects(&self) -> &SubjectSpace {
        &self.subjects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn manager(broker: &InMemoryBroker) -> TopicLogManager {
        TopicLogManager::new(
            Arc::new(broker.session()),
            SubjectSpace::new("orders").unwrap(),
            Arc::new(TransportConfig::new("orders")),
        )
    }

    #[test_case(MessageKind::Event, "ORDERS_EVENTS", "orders.event.>" ; "events")]
    #[test_case(MessageKind::Command, "ORDERS_COMMANDS", "orders.command.>" ; "commands")]
    fn test_spec_is_deterministic(kind: MessageKind, name: &str, filter: &str) {
        let broker = InMemoryBroker::new();
        let spec = manager(&broker).spec(kind);
        assert_eq!(spec.name, name);
        assert_eq!(spec.subjects, vec![filter.to_string()]);
    }

    #[tokio::test]
    async fn test_ensure_creates_then_updates() {
        let broker = InMemoryBroker::new();
        let logs = manager(&broker);

        logs.ensure(MessageKind::Command).await.unwrap();
        logs.ensure(MessageKind::Command).await.unwrap();

        let stats = broker.stats();
        assert_eq!(stats.logs_created, 1);
        assert_eq!(stats.log_updates, 1);
        assert_eq!(broker.log_names(), vec!["ORDERS_COMMANDS".to_string()]);
    }

    #[tokio::test]
    async fn test_ensure_all_is_idempotent() {
        let broker = InMemoryBroker::new();
        let logs = manager(&broker);

        let (events, commands) = logs.ensure_all().await.unwrap();
        let before = broker.log_names();
        logs.ensure_all().await.unwrap();
        logs.ensure_all().await.unwrap();

        assert_eq!(events.subjects, vec!["orders.event.>".to_string()]);
        assert_eq!(commands.subjects, vec!["orders.command.>".to_string()]);
        assert_eq!(broker.log_names(), before);
        assert_eq!(broker.stats().logs_created, 2);
    }

    #[tokio::test]
    async fn test_ensure_all_fails_fast() {
        let broker = InMemoryBroker::new();
        let session = broker.session();
        let logs = TopicLogManager::new(
            Arc::new(session),
            SubjectSpace::new("orders").unwrap(),
            Arc::new(TransportConfig::new("orders")),
        );
        logs.broker().close().await.unwrap();

        assert_eq!(logs.ensure_all().await.err(), Some(TransportError::Closed));
    }
}
