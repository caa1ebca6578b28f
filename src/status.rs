// Copyright (c) 2025 - Cowboy AI, Inc.
//! Connection status bus
//!
//! A single internal channel carrying connection lifecycle events, fanned out
//! to subscribers by event kind. Everything downstream of the connection
//! observes readiness through the bus instead of polling the client.
//!
//! ```text
//! Connecting → Connected → LogAttached → [Disconnected ⇄ Reconnected] → Closed
//! ```
//!
//! Alongside the event stream the bus keeps a derived current status, so a
//! late subscriber can check connectivity synchronously instead of racing the
//! next event.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{TransportError, TransportResult};

const EVENT_CAPACITY: usize = 64;

/// Kinds of lifecycle events carried on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Connecting,
    Connected,
    Reconnected,
    Disconnected,
    Error,
    LogAttached,
}

/// A connection lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// A connection attempt started
    Connecting,
    /// The initial connection was established
    Connected,
    /// The connection was re-established after a drop
    Reconnected,
    /// The connection dropped
    Disconnected,
    /// A connection or server error occurred
    Error(String),
    /// The log manager is attached and usable
    LogAttached,
}

impl StatusEvent {
    pub fn kind(&self) -> StatusKind {
        match self {
            StatusEvent::Connecting => StatusKind::Connecting,
            StatusEvent::Connected => StatusKind::Connected,
            StatusEvent::Reconnected => StatusKind::Reconnected,
            StatusEvent::Disconnected => StatusKind::Disconnected,
            StatusEvent::Error(_) => StatusKind::Error,
            StatusEvent::LogAttached => StatusKind::LogAttached,
        }
    }
}

/// Derived current connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection attempt yet
    Idle,
    Connecting,
    Connected,
    Reconnected,
    Disconnected,
    Error,
    LogAttached,
    /// The bus was destroyed; terminal
    Closed,
}

impl ConnectionStatus {
    /// Whether messages can be published right now
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connected
                | ConnectionStatus::Reconnected
                | ConnectionStatus::LogAttached
        )
    }

    fn apply(self, event: &StatusEvent) -> ConnectionStatus {
        match event {
            StatusEvent::Connecting => ConnectionStatus::Connecting,
            StatusEvent::Connected => ConnectionStatus::Connected,
            StatusEvent::Reconnected => ConnectionStatus::Reconnected,
            StatusEvent::Disconnected => ConnectionStatus::Disconnected,
            // Server-side errors on a live connection leave it usable
            StatusEvent::Error(_) if self.is_ready() => self,
            StatusEvent::Error(_) => ConnectionStatus::Error,
            StatusEvent::LogAttached => ConnectionStatus::LogAttached,
        }
    }
}

struct BusInner {
    events: broadcast::Sender<StatusEvent>,
    current: watch::Sender<ConnectionStatus>,
    shutdown: CancellationToken,
}

/// Internal publish/subscribe channel for connection lifecycle events
///
/// Cloning the bus yields another handle to the same channel.
#[derive(Clone)]
pub struct StatusBus {
    inner: Arc<BusInner>,
}

impl StatusBus {
    /// Create a new bus in the `Idle` status
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (current, _) = watch::channel(ConnectionStatus::Idle);

        Self {
            inner: Arc::new(BusInner {
                events,
                current,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Publish a lifecycle event
    ///
    /// Ignored once the bus has been destroyed.
    pub fn emit(&self, event: StatusEvent) {
        if self.is_destroyed() {
            debug!(?event, "Status bus destroyed, dropping event");
            return;
        }

        self.inner.current.send_if_modified(|status| {
            let next = status.apply(&event);
            let changed = next != *status;
            *status = next;
            changed
        });

        debug!(?event, status = ?self.status(), "Connection status event");

        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// The current derived status
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.current.borrow()
    }

    /// Whether the connection is ready for publishing
    pub fn is_ready(&self) -> bool {
        self.status().is_ready()
    }

    /// Subscribe to events of one kind
    ///
    /// The subscription ends when the bus is destroyed.
    pub fn on(&self, kind: StatusKind) -> StatusSubscription {
        StatusSubscription {
            events: self.inner.events.subscribe(),
            kind: Some(kind),
            shutdown: self.inner.shutdown.clone(),
        }
    }

    /// Subscribe to events of every kind
    pub fn on_any(&self) -> StatusSubscription {
        StatusSubscription {
            events: self.inner.events.subscribe(),
            kind: None,
            shutdown: self.inner.shutdown.clone(),
        }
    }

    /// Watch the derived status
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.current.subscribe()
    }

    /// Wait until the connection is ready
    ///
    /// Returns immediately when already ready and fails with
    /// [`TransportError::Closed`] if the bus is destroyed first.
    pub async fn wait_ready(&self) -> TransportResult<()> {
        let mut status = self.watch();
        let closed = {
            let current = status
                .wait_for(|s| s.is_ready() || *s == ConnectionStatus::Closed)
                .await
                .map_err(|_| TransportError::Closed)?;
            *current == ConnectionStatus::Closed
        };

        if closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Destroy the bus; subscriptions end and later emits are ignored
    pub fn destroy(&self) {
        if self.is_destroyed() {
            return;
        }

        self.inner.current.send_replace(ConnectionStatus::Closed);
        self.inner.shutdown.cancel();
        debug!("Status bus destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A kind-filtered subscription to the status bus
pub struct StatusSubscription {
    events: broadcast::Receiver<StatusEvent>,
    kind: Option<StatusKind>,
    shutdown: CancellationToken,
}

impl StatusSubscription {
    /// Next matching event, or `None` once the bus is destroyed
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                next = self.events.recv() => next,
            };

            match next {
                Ok(event) if self.kind.map_or(true, |kind| event.kind() == kind) => {
                    return Some(event)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Status subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_initial_status() {
        let bus = StatusBus::new();
        assert_eq!(bus.status(), ConnectionStatus::Idle);
        assert!(!bus.is_ready());
    }

    #[test]
    fn test_status_follows_lifecycle() {
        let bus = StatusBus::new();

        bus.emit(StatusEvent::Connecting);
        assert_eq!(bus.status(), ConnectionStatus::Connecting);

        bus.emit(StatusEvent::Connected);
        assert!(bus.is_ready());

        bus.emit(StatusEvent::LogAttached);
        assert_eq!(bus.status(), ConnectionStatus::LogAttached);

        bus.emit(StatusEvent::Disconnected);
        assert!(!bus.is_ready());

        bus.emit(StatusEvent::Reconnected);
        assert!(bus.is_ready());
    }

    #[test]
    fn test_error_does_not_downgrade_live_connection() {
        let bus = StatusBus::new();
        bus.emit(StatusEvent::Connected);
        bus.emit(StatusEvent::Error("permissions violation".into()));
        assert_eq!(bus.status(), ConnectionStatus::Connected);

        let bus = StatusBus::new();
        bus.emit(StatusEvent::Connecting);
        bus.emit(StatusEvent::Error("connection refused".into()));
        assert_eq!(bus.status(), ConnectionStatus::Error);
    }

    #[test]
    fn test_emit_after_destroy_is_ignored() {
        let bus = StatusBus::new();
        bus.destroy();
        bus.emit(StatusEvent::Connected);
        assert_eq!(bus.status(), ConnectionStatus::Closed);
        assert!(bus.is_destroyed());
    }

    #[tokio::test]
    async fn test_subscription_filters_by_kind() {
        let bus = StatusBus::new();
        let mut connected = bus.on(StatusKind::Reconnected);

        bus.emit(StatusEvent::Connected);
        bus.emit(StatusEvent::Disconnected);
        bus.emit(StatusEvent::Reconnected);

        assert_eq!(connected.recv().await, Some(StatusEvent::Reconnected));
    }

    #[tokio::test]
    async fn test_subscription_ends_on_destroy() {
        let bus = StatusBus::new();
        let mut errors = bus.on(StatusKind::Error);

        let waiter = tokio::spawn(async move { errors.recv().await });
        tokio::task::yield_now().await;
        bus.destroy();

        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wait_ready() {
        let bus = StatusBus::new();
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.wait_ready().await })
        };

        bus.emit(StatusEvent::Connecting);
        bus.emit(StatusEvent::Connected);

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_wait_ready_pends_until_connected() {
        let bus = StatusBus::new();
        let mut waiter = tokio_test::task::spawn(bus.wait_ready());

        tokio_test::assert_pending!(waiter.poll());
        bus.emit(StatusEvent::Connecting);
        tokio_test::assert_pending!(waiter.poll());

        bus.emit(StatusEvent::Connected);
        assert!(waiter.is_woken());
        tokio_test::assert_ready_ok!(waiter.poll());
    }

    #[tokio::test]
    async fn test_wait_ready_fails_when_closed() {
        let bus = StatusBus::new();
        bus.destroy();
        assert_eq!(bus.wait_ready().await, Err(TransportError::Closed));
    }
}
