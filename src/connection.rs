// Copyright (c) 2025 - Cowboy AI, Inc.
//! Broker connection
//!
//! Owns the single multiplexed broker connection of a transport instance and
//! exposes it as a cached, readiness-gated resource:
//!
//! - The first [`BrokerConnection::connect`] call establishes the connection;
//!   concurrent callers wait for that same attempt.
//! - A failed attempt is cached. Every later waiter receives the same error
//!   until [`BrokerConnection::reconnect`] succeeds.
//! - [`BrokerConnection::logs`] yields the topic log manager once attached.
//!
//! Lifecycle transitions are reported on the [`StatusBus`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::broker::{Broker, Connector};
use crate::config::TransportConfig;
use crate::errors::{TransportError, TransportResult};
use crate::logs::TopicLogManager;
use crate::status::{StatusBus, StatusEvent};
use crate::subjects::SubjectSpace;

enum Slot {
    Idle,
    Ready(Arc<dyn Broker>),
    Failed(TransportError),
}

pub struct BrokerConnection {
    connector: Arc<dyn Connector>,
    status: StatusBus,
    subjects: SubjectSpace,
    config: Arc<TransportConfig>,
    slot: Mutex<Slot>,
    current: RwLock<Option<Arc<dyn Broker>>>,
    closed: AtomicBool,
}

impl BrokerConnection {
    pub fn new(
        connector: Arc<dyn Connector>,
        status: StatusBus,
        subjects: SubjectSpace,
        config: Arc<TransportConfig>,
    ) -> Self {
        Self {
            connector,
            status,
            subjects,
            config,
            slot: Mutex::new(Slot::Idle),
            current: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the connected broker, connecting on first use
    ///
    /// Replays a cached failure instead of retrying.
    pub async fn connect(&self) -> TransportResult<Arc<dyn Broker>> {
        let mut slot = self.slot.lock().await;
        match &*slot {
            Slot::Ready(broker) => return Ok(Arc::clone(broker)),
            Slot::Failed(err) => return Err(err.clone()),
            Slot::Idle => {}
        }

        self.attempt(&mut slot).await
    }

    /// Discard a cached failure and try again
    ///
    /// An established connection is returned as is.
    pub async fn reconnect(&self) -> TransportResult<Arc<dyn Broker>> {
        let mut slot = self.slot.lock().await;
        if let Slot::Ready(broker) = &*slot {
            return Ok(Arc::clone(broker));
        }

        self.attempt(&mut slot).await
    }

    async fn attempt(&self, slot: &mut Slot) -> TransportResult<Arc<dyn Broker>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        self.status.emit(StatusEvent::Connecting);
        info!(servers = ?self.config.servers, "Connecting to broker");

        match self.connector.connect(self.status.clone()).await {
            Ok(broker) => {
                *slot = Slot::Ready(Arc::clone(&broker));
                *self.current.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(Arc::clone(&broker));

                self.status.emit(StatusEvent::Connected);
                // Log management rides on the same connection
                self.status.emit(StatusEvent::LogAttached);
                info!(service = %self.subjects.service(), "Broker connection established");
                Ok(broker)
            }
            Err(err) => {
                error!(error = %err, "Broker connection failed");
                *slot = Slot::Failed(err.clone());
                self.status.emit(StatusEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    /// The connected broker, without waiting
    ///
    /// Fails with [`TransportError::Unavailable`] before the connection is
    /// established.
    pub fn broker(&self) -> TransportResult<Arc<dyn Broker>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TransportError::Unavailable("broker connection not established".to_string()))
    }

    /// Topic log manager on the established connection
    pub async fn logs(&self) -> TransportResult<TopicLogManager> {
        let broker = self.connect().await?;
        Ok(TopicLogManager::new(
            broker,
            self.subjects.clone(),
            Arc::clone(&self.config),
        ))
    }

    pub fn status(&self) -> &StatusBus {
        &self.status
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drain and close the connection
    ///
    /// Falls back to a hard close when draining fails. Calling it again is a
    /// no-op.
    pub async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let broker = {
            let mut slot = self.slot.lock().await;
            let previous = std::mem::replace(&mut *slot, Slot::Failed(TransportError::Closed));
            self.current
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match previous {
                Slot::Ready(broker) => Some(broker),
                _ => None,
            }
        };

        let Some(broker) = broker else {
            return Ok(());
        };

        info!("Draining broker connection");
        if let Err(err) = broker.drain().await {
            warn!(error = %err, "Drain failed, closing connection");
            broker.close().await?;
        }

        info!("Broker connection closed");
        Ok(())
    }
}
