// Copyright (c) 2025 - Cowboy AI, Inc.
//! Durable consumer management
//!
//! One durable pull consumer per topic log. Replicas of a service start
//! concurrently and all try to provision the same consumer, so `ensure`
//! runs a check, create, recheck protocol:
//!
//! 1. Look the consumer up by its deterministic durable name
//! 2. If absent, create it
//! 3. If creation lost the race to a replica with a different definition
//!    ("already exists"), look it up again
//!
//! Every racing replica ends up attached to the one consumer the winner
//! created, even when the replicas disagree on its settings. Any other error
//! propagates.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{Broker, ConsumerInfo, ConsumerSpec};
use crate::config::TransportConfig;
use crate::errors::{TransportError, TransportResult};
use crate::subjects::{MessageKind, SubjectSpace};

#[derive(Clone)]
pub struct DurableConsumerManager {
    broker: Arc<dyn Broker>,
    subjects: SubjectSpace,
    config: Arc<TransportConfig>,
}

impl DurableConsumerManager {
    pub fn new(broker: Arc<dyn Broker>, subjects: SubjectSpace, config: Arc<TransportConfig>) -> Self {
        Self {
            broker,
            subjects,
            config,
        }
    }

    /// Full consumer definition for a kind
    pub fn spec(&self, kind: MessageKind) -> ConsumerSpec {
        ConsumerSpec::durable(
            self.subjects.durable_name(kind),
            self.subjects.filter(kind),
            &self.config.kind(kind).consumer,
        )
    }

    /// Make sure the durable consumer for `kind` exists on `log_name`
    pub async fn ensure(&self, log_name: &str, kind: MessageKind) -> TransportResult<ConsumerInfo> {
        let spec = self.spec(kind);

        match self.broker.consumer_info(log_name, &spec.durable_name).await {
            Ok(info) => {
                debug!(stream = %log_name, consumer = %spec.durable_name, "Durable consumer exists");
                return Ok(info);
            }
            Err(TransportError::ConsumerNotFound(_)) => {}
            Err(err) => return Err(err),
        }

        info!(
            stream = %log_name,
            consumer = %spec.durable_name,
            filter = %spec.filter_subject,
            "Creating durable consumer"
        );

        match self.broker.create_consumer(log_name, &spec).await {
            Ok(info) => Ok(info),
            Err(TransportError::ConsumerExists(_)) => {
                warn!(
                    stream = %log_name,
                    consumer = %spec.durable_name,
                    "Durable consumer created concurrently, attaching to it"
                );
                self.broker.consumer_info(log_name, &spec.durable_name).await
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::logs::TopicLogManager;
    use pretty_assertions::assert_eq;

    async fn provisioned(broker: &InMemoryBroker) -> (DurableConsumerManager, String) {
        let subjects = SubjectSpace::new("orders").unwrap();
        let config = Arc::new(TransportConfig::new("orders"));
        let logs = TopicLogManager::new(Arc::new(broker.session()), subjects.clone(), config.clone());
        let log = logs.ensure(MessageKind::Event).await.unwrap();

        let consumers = DurableConsumerManager::new(Arc::new(broker.session()), subjects, config);
        (consumers, log.name)
    }

    #[tokio::test]
    async fn test_ensure_creates_once() {
        let broker = InMemoryBroker::new();
        let (consumers, log) = provisioned(&broker).await;

        let first = consumers.ensure(&log, MessageKind::Event).await.unwrap();
        let second = consumers.ensure(&log, MessageKind::Event).await.unwrap();

        assert_eq!(first.durable_name, "orders-event");
        assert_eq!(first.filter_subject, "orders.event.>");
        assert_eq!(first.durable_name, second.durable_name);
        assert_eq!(broker.stats().consumers_created, 1);
        assert_eq!(broker.consumer_names(&log), vec!["orders-event".to_string()]);
    }

    #[tokio::test]
    async fn test_differing_replica_attaches_to_existing_consumer() {
        let broker = InMemoryBroker::new();
        let (consumers, log) = provisioned(&broker).await;
        let original = consumers.ensure(&log, MessageKind::Event).await.unwrap();

        // A replica running with different consumer settings
        let mut config = TransportConfig::new("orders");
        config.kind_mut(MessageKind::Event).consumer.max_ack_pending = 7;
        let replica = DurableConsumerManager::new(
            Arc::new(broker.session()),
            SubjectSpace::new("orders").unwrap(),
            Arc::new(config),
        );
        let spec = replica.spec(MessageKind::Event);

        let created = broker.session().create_consumer(&log, &spec).await;
        assert_eq!(created, Err(TransportError::ConsumerExists("orders-event".into())));

        let attached = replica.ensure(&log, MessageKind::Event).await.unwrap();
        assert_eq!(attached, original);
        assert_eq!(broker.stats().consumers_created, 1);
    }

    #[tokio::test]
    async fn test_missing_log_is_fatal() {
        let broker = InMemoryBroker::new();
        let consumers = DurableConsumerManager::new(
            Arc::new(broker.session()),
            SubjectSpace::new("orders").unwrap(),
            Arc::new(TransportConfig::new("orders")),
        );

        let result = consumers.ensure("ORDERS_EVENTS", MessageKind::Event).await;
        assert!(matches!(result, Err(TransportError::LogNotFound(_))));
    }
}
