// Copyright (c) 2025 - Cowboy AI, Inc.
//! Transport composition root
//!
//! Wires connection, status bus, log and consumer provisioning, pull runners,
//! dispatcher and client into one start/close lifecycle.
//!
//! ```rust,no_run
//! use cim_transport::{command_fn, HandlerRegistry, HandlerResult, Transport, TransportConfig};
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let handlers = HandlerRegistry::new().with_command(
//!         "order.create",
//!         command_fn(|payload: Value, _ctx| async move { HandlerResult::Ok(json!({ "ok": true, "order": payload })) }),
//!     )?;
//!
//!     let transport = Transport::nats(TransportConfig::new("orders"), handlers)?;
//!     transport.start().await?;
//!
//!     let reply = transport.client().send("order.create", &json!({ "data": "x" })).await?;
//!     println!("{}", reply);
//!
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::nats::{NatsConfig, NatsConnector};
use crate::broker::{Connector, FetchOptions};
use crate::client::TransportClient;
use crate::config::TransportConfig;
use crate::connection::BrokerConnection;
use crate::consumers::DurableConsumerManager;
use crate::dispatcher::Dispatcher;
use crate::errors::{TransportError, TransportResult};
use crate::registry::{HandlerRegistry, PatternRegistry};
use crate::runner::PullRunner;
use crate::status::StatusBus;
use crate::subjects::{MessageKind, SubjectSpace};

pub struct Transport {
    config: Arc<TransportConfig>,
    subjects: SubjectSpace,
    status: StatusBus,
    connection: Arc<BrokerConnection>,
    registry: Arc<PatternRegistry>,
    client: TransportClient,
    clients: Mutex<HashMap<String, TransportClient>>,
    shutdown: CancellationToken,
    runners: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Transport {
    /// Build a transport; nothing touches the broker until [`start`](Self::start)
    pub fn new(
        config: TransportConfig,
        connector: Arc<dyn Connector>,
        handlers: HandlerRegistry,
    ) -> TransportResult<Self> {
        config.validate()?;

        let config = Arc::new(config);
        let subjects = SubjectSpace::new(config.service.as_str())?;
        let status = StatusBus::new();
        let shutdown = CancellationToken::new();
        let connection = Arc::new(BrokerConnection::new(
            connector,
            status.clone(),
            subjects.clone(),
            Arc::clone(&config),
        ));
        let registry = Arc::new(PatternRegistry::new(subjects.clone(), handlers));

        let client = TransportClient::new(
            Arc::clone(&connection),
            subjects.clone(),
            subjects.reply_subject(&Uuid::now_v7().simple().to_string()),
            config.reply_timeout,
            shutdown.child_token(),
        );

        Ok(Self {
            config,
            subjects,
            status,
            connection,
            registry,
            client,
            clients: Mutex::new(HashMap::new()),
            shutdown,
            runners: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Transport on NATS JetStream
    pub fn nats(config: TransportConfig, handlers: HandlerRegistry) -> TransportResult<Self> {
        let connector = NatsConnector::new(NatsConfig::from(&config));
        Self::new(config, Arc::new(connector), handlers)
    }

    /// Connect, provision logs and consumers, and start pulling
    ///
    /// Provisioning is fail-fast: any error aborts the start. Consumers and
    /// runners are only set up for kinds that have handlers. Calling it again
    /// after success is a no-op.
    pub async fn start(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        info!(service = %self.subjects.service(), "Starting transport");

        let logs = self.connection.logs().await?;
        let (events_log, commands_log) = logs.ensure_all().await?;

        let broker = Arc::clone(logs.broker());
        let consumers = DurableConsumerManager::new(
            Arc::clone(&broker),
            self.subjects.clone(),
            Arc::clone(&self.config),
        );

        let kinds: Vec<(MessageKind, String)> = [
            (MessageKind::Event, events_log.name),
            (MessageKind::Command, commands_log.name),
        ]
        .into_iter()
        .filter(|(kind, _)| self.registry.handles(*kind))
        .collect();

        let attached = futures::future::try_join_all(
            kinds
                .iter()
                .map(|(kind, log_name)| consumers.ensure(log_name, *kind)),
        )
        .await?;

        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.registry),
            Arc::clone(&broker),
            self.config.command_timeout,
            self.shutdown.child_token(),
        ));

        let options = FetchOptions {
            batch_size: self.config.fetch.batch_size,
            expires: self.config.fetch.expires,
        };

        let handles: Vec<JoinHandle<()>> = kinds
            .iter()
            .zip(attached)
            .map(|((kind, log_name), consumer)| {
                PullRunner::new(
                    Arc::clone(&broker),
                    Arc::clone(&dispatcher),
                    *kind,
                    log_name.as_str(),
                    consumer.durable_name,
                    options,
                    self.config.fetch.restart_delay,
                    self.shutdown.child_token(),
                )
                .with_concurrency_limit(self.config.max_concurrent_dispatch)
                .spawn()
            })
            .collect();
        self.runners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);

        if let Err(e) = self.client.listen().await {
            warn!(error = %e, "Reply listener not started, retrying on first command");
        }

        info!(
            service = %self.subjects.service(),
            consuming = ?kinds.iter().map(|(kind, _)| kind.token()).collect::<Vec<_>>(),
            "Transport started"
        );
        Ok(())
    }

    /// Producer for this service
    pub fn client(&self) -> TransportClient {
        self.client.clone()
    }

    /// Producer for another service, sharing this transport's connection
    ///
    /// Replies are received under this service's reply namespace. Clients are
    /// cached per target, so repeated calls share one reply subscription.
    pub fn client_for(&self, service: &str) -> TransportResult<TransportClient> {
        let target = SubjectSpace::new(service)?;
        if target == self.subjects {
            return Ok(self.client());
        }

        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let client = clients.entry(service.to_string()).or_insert_with(|| {
            TransportClient::new(
                Arc::clone(&self.connection),
                target,
                self.subjects
                    .reply_subject(&Uuid::now_v7().simple().to_string()),
                self.config.reply_timeout,
                self.shutdown.child_token(),
            )
        });
        Ok(client.clone())
    }

    pub fn status(&self) -> &StatusBus {
        &self.status
    }

    pub fn subjects(&self) -> &SubjectSpace {
        &self.subjects
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Stop the runners, drain the connection and destroy the status bus
    ///
    /// Idempotent.
    pub async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(service = %self.subjects.service(), "Closing transport");
        self.shutdown.cancel();

        let runners: Vec<JoinHandle<()>> = self
            .runners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for runner in runners {
            if let Err(e) = runner.await {
                error!(error = %e, "Pull runner failed");
            }
        }

        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let result = self.connection.close().await;
        self.status.destroy();

        info!(service = %self.subjects.service(), "Transport closed");
        result
    }
}
