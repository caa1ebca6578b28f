// Copyright (c) 2025 - Cowboy AI, Inc.
//! Producer side of the transport
//!
//! - Events are published and forgotten.
//! - Commands carry a fresh correlation id and this client's reply subject.
//!   The callback waits in a pending table until the matching reply arrives,
//!   the call is cancelled, or the entry expires.
//!
//! All commands of one client share one reply subject. The subscription is
//! made once, lazily, on the first command (or when the transport starts).
//!
//! # Example
//!
//! ```rust,no_run
//! # use cim_transport::client::TransportClient;
//! # async fn demo(client: TransportClient) -> cim_transport::TransportResult<()> {
//! use serde_json::json;
//!
//! client.dispatch_event("order.created", &json!({ "id": 7 })).await?;
//!
//! let reply = client.send("order.create", &json!({ "data": "x" })).await?;
//! println!("reply: {}", reply);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{InboundMessage, MessageHeaders};
use crate::connection::BrokerConnection;
use crate::errors::{TransportError, TransportResult};
use crate::subjects::{MessageKind, SubjectSpace};

/// Callback receiving a command's reply
pub type ReplyCallback = Box<dyn FnOnce(TransportResult<Value>) + Send>;

struct PendingEntry {
    subject: String,
    created: Instant,
    callback: ReplyCallback,
}

struct ClientShared {
    connection: Arc<BrokerConnection>,
    target: SubjectSpace,
    reply_subject: String,
    reply_timeout: Duration,
    pending: Mutex<HashMap<String, PendingEntry>>,
    listener: OnceCell<()>,
    shutdown: CancellationToken,
}

impl ClientShared {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in pending.drain() {
            (entry.callback)(Err(TransportError::Closed));
        }
    }
}

/// Publishes events and commands for one target service
///
/// Cloning yields another handle to the same client and pending table.
#[derive(Clone)]
pub struct TransportClient {
    shared: Arc<ClientShared>,
}

impl TransportClient {
    /// Client addressing `target`, receiving replies on `reply_subject`
    pub fn new(
        connection: Arc<BrokerConnection>,
        target: SubjectSpace,
        reply_subject: impl Into<String>,
        reply_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                connection,
                target,
                reply_subject: reply_subject.into(),
                reply_timeout,
                pending: Mutex::new(HashMap::new()),
                listener: OnceCell::new(),
                shutdown,
            }),
        }
    }

    /// The service this client addresses
    pub fn target(&self) -> &SubjectSpace {
        &self.shared.target
    }

    pub fn reply_subject(&self) -> &str {
        &self.shared.reply_subject
    }

    /// Number of commands awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }

    fn ready_broker(&self) -> TransportResult<Arc<dyn crate::broker::Broker>> {
        if self.shared.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let status = self.shared.connection.status().status();
        if !status.is_ready() {
            return Err(TransportError::Unavailable(format!(
                "connection is {:?}",
                status
            )));
        }

        self.shared.connection.broker()
    }

    /// Publish an event without waiting for it to be processed
    ///
    /// Fails immediately with [`TransportError::Unavailable`] when the
    /// connection is not ready.
    pub async fn dispatch_event<T: Serialize + ?Sized>(&self, pattern: &str, data: &T) -> TransportResult<()> {
        let broker = self.ready_broker()?;
        let payload = serde_json::to_vec(data)?;
        let subject = self.shared.target.subject(MessageKind::Event, pattern);

        broker
            .publish(&subject, &MessageHeaders::stamped(), Bytes::from(payload))
            .await?;

        debug!(%subject, "Event published");
        Ok(())
    }

    /// Publish a command; `callback` receives the reply
    ///
    /// Never fails directly: readiness, encoding and publish failures are
    /// handed to `callback` before this returns. An `{"error": ..}` reply from
    /// the handler arrives as `Ok`.
    pub async fn publish<T, F>(&self, pattern: &str, data: &T, callback: F) -> PendingCommand
    where
        T: Serialize + ?Sized,
        F: FnOnce(TransportResult<Value>) + Send + 'static,
    {
        let correlation_id = Uuid::now_v7().to_string();
        let subject = self.shared.target.subject(MessageKind::Command, pattern);
        let handle = PendingCommand {
            correlation_id: correlation_id.clone(),
            shared: Arc::clone(&self.shared),
        };

        let prepared = self
            .ready_broker()
            .and_then(|broker| Ok((broker, serde_json::to_vec(data)?)));
        let (broker, payload) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                callback(Err(e));
                return handle;
            }
        };

        if let Err(e) = self.listen().await {
            callback(Err(e));
            return handle;
        }

        // Registered before publishing so a fast reply finds its entry
        self.shared.pending().insert(
            correlation_id.clone(),
            PendingEntry {
                subject: subject.clone(),
                created: Instant::now(),
                callback: Box::new(callback),
            },
        );

        let headers = MessageHeaders::stamped()
            .with_correlation_id(correlation_id.as_str())
            .with_reply_to(self.shared.reply_subject.as_str());

        if let Err(e) = broker.publish(&subject, &headers, Bytes::from(payload)).await {
            warn!(%subject, %correlation_id, error = %e, "Command publish failed");
            let entry = self.shared.pending().remove(&correlation_id);
            if let Some(entry) = entry {
                (entry.callback)(Err(e));
            }
            return handle;
        }

        debug!(%subject, %correlation_id, "Command published");
        handle
    }

    /// Publish a command and wait for its reply
    ///
    /// Gives up after the reply timeout and removes the pending entry.
    pub async fn send<T: Serialize + ?Sized>(&self, pattern: &str, data: &T) -> TransportResult<Value> {
        let (tx, rx) = oneshot::channel();
        let pending = self
            .publish(pattern, data, move |result| {
                let _ = tx.send(result);
            })
            .await;

        match tokio::time::timeout(self.shared.reply_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                pending.cancel();
                Err(TransportError::Timeout(format!(
                    "no reply to command '{}' within {:?}",
                    pattern, self.shared.reply_timeout
                )))
            }
        }
    }

    /// Subscribe to the reply subject, once
    ///
    /// Also starts the sweep expiring abandoned pending commands.
    pub async fn listen(&self) -> TransportResult<()> {
        self.shared
            .listener
            .get_or_try_init(|| async {
                let broker = self.ready_broker()?;
                let mut replies = broker.subscribe(&self.shared.reply_subject).await?;
                info!(subject = %self.shared.reply_subject, "Listening for command replies");

                // Weak, so dropping the last client handle ends the task
                let weak = Arc::downgrade(&self.shared);
                let subject = self.shared.reply_subject.clone();
                let shutdown = self.shared.shutdown.clone();
                let period = self.sweep_interval();
                tokio::spawn(async move {
                    let mut sweep = tokio::time::interval(period);
                    loop {
                        let reply = tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = sweep.tick() => None,
                            reply = replies.next() => match reply {
                                Some(reply) => Some(reply),
                                None => {
                                    warn!(%subject, "Reply subscription ended");
                                    break;
                                }
                            },
                        };

                        let Some(shared) = weak.upgrade() else {
                            debug!(%subject, "Client dropped, releasing reply subscription");
                            return;
                        };
                        let client = TransportClient { shared };
                        match reply {
                            Some(reply) => client.route_reply(reply),
                            None => {
                                client.sweep_expired();
                            }
                        }
                    }

                    if let Some(shared) = weak.upgrade() {
                        TransportClient { shared }.fail_pending(TransportError::Closed);
                    }
                });

                Ok::<(), TransportError>(())
            })
            .await
            .map(|_| ())
    }

    fn sweep_interval(&self) -> Duration {
        (self.shared.reply_timeout / 10).clamp(Duration::from_millis(10), Duration::from_secs(5))
    }

    /// Hand a reply to the command waiting for it
    ///
    /// Replies without a matching pending command are dropped.
    pub fn route_reply(&self, reply: InboundMessage) {
        let Some(correlation_id) = reply.headers.correlation_id.as_deref() else {
            warn!(subject = %reply.subject, "Reply without correlation-id dropped");
            return;
        };

        let Some(entry) = self.shared.pending().remove(correlation_id) else {
            warn!(%correlation_id, "Reply for unknown or expired command dropped");
            return;
        };

        debug!(%correlation_id, subject = %entry.subject, "Routing command reply");
        let result = serde_json::from_slice::<Value>(&reply.payload)
            .map_err(|e| TransportError::Deserialization(e.to_string()));
        (entry.callback)(result);
    }

    /// Expire pending commands older than the reply timeout
    ///
    /// Returns how many were expired.
    pub fn sweep_expired(&self) -> usize {
        let timeout = self.shared.reply_timeout;
        let expired: Vec<(String, PendingEntry)> = {
            let mut pending = self.shared.pending();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| entry.created.elapsed() >= timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = expired.len();
        for (correlation_id, entry) in expired {
            warn!(%correlation_id, subject = %entry.subject, "Command reply timed out");
            (entry.callback)(Err(TransportError::Timeout(format!(
                "no reply to {} within {:?}",
                entry.subject, timeout
            ))));
        }
        count
    }

    fn fail_pending(&self, error: TransportError) {
        let drained: Vec<PendingEntry> = self.shared.pending().drain().map(|(_, e)| e).collect();
        for entry in drained {
            (entry.callback)(Err(error.clone()));
        }
    }
}

/// Handle to a published command
pub struct PendingCommand {
    correlation_id: String,
    shared: Arc<ClientShared>,
}

impl PendingCommand {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Stop waiting for the reply
    ///
    /// Returns `false` if the reply already arrived or the entry expired. The
    /// callback is not invoked.
    pub fn cancel(&self) -> bool {
        self.shared.pending().remove(&self.correlation_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{InMemoryBroker, InMemoryConnector};
    use crate::config::TransportConfig;
    use crate::status::StatusBus;
    use serde_json::json;

    fn client(broker: &InMemoryBroker, reply_timeout: Duration) -> (TransportClient, Arc<BrokerConnection>) {
        let subjects = SubjectSpace::new("orders").unwrap();
        let connection = Arc::new(BrokerConnection::new(
            Arc::new(InMemoryConnector::new(broker.clone())),
            StatusBus::new(),
            subjects.clone(),
            Arc::new(TransportConfig::new("orders")),
        ));
        let client = TransportClient::new(
            Arc::clone(&connection),
            subjects,
            "orders.reply.test",
            reply_timeout,
            CancellationToken::new(),
        );
        (client, connection)
    }

    #[tokio::test]
    async fn test_not_ready_fails_fast() {
        let broker = InMemoryBroker::new();
        let (client, _connection) = client(&broker, Duration::from_secs(5));

        let err = client.dispatch_event("order.created", &json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));

        let (tx, rx) = oneshot::channel();
        client
            .publish("order.create", &json!({}), move |result| {
                let _ = tx.send(result);
            })
            .await;
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
        assert_eq!(client.pending_count(), 0);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_sets_reply_headers() {
        let broker = InMemoryBroker::new();
        let (client, connection) = client(&broker, Duration::from_secs(5));
        connection.connect().await.unwrap();

        let pending = client.publish("order.create", &json!({ "data": "x" }), |_| {}).await;

        let published = broker.published_on("orders.command.order.create");
        assert_eq!(published.len(), 1);
        let headers = &published[0].headers;
        assert_eq!(headers.correlation_id.as_deref(), Some(pending.correlation_id()));
        assert_eq!(headers.reply_to.as_deref(), Some("orders.reply.test"));
        assert!(headers.message_id.is_some());
        assert_eq!(client.pending_count(), 1);

        assert!(pending.cancel());
        assert!(!pending.cancel());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_route_reply_invokes_callback_once() {
        let broker = InMemoryBroker::new();
        let (client, connection) = client(&broker, Duration::from_secs(5));
        connection.connect().await.unwrap();

        let (tx, rx) = oneshot::channel();
        let pending = client
            .publish("order.create", &json!({}), move |result| {
                let _ = tx.send(result);
            })
            .await;

        let reply = InboundMessage {
            subject: "orders.reply.test".into(),
            headers: MessageHeaders::new().with_correlation_id(pending.correlation_id()),
            payload: Bytes::from_static(br#"{"ok":true}"#),
        };
        client.route_reply(reply.clone());
        client.route_reply(reply);

        assert_eq!(rx.await.unwrap(), Ok(json!({ "ok": true })));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_reply() {
        let broker = InMemoryBroker::new();
        let (client, connection) = client(&broker, Duration::from_secs(5));
        connection.connect().await.unwrap();

        let (tx, rx) = oneshot::channel();
        let pending = client
            .publish("order.create", &json!({}), move |result| {
                let _ = tx.send(result);
            })
            .await;

        client.route_reply(InboundMessage {
            subject: "orders.reply.test".into(),
            headers: MessageHeaders::new().with_correlation_id(pending.correlation_id()),
            payload: Bytes::from_static(b"not json"),
        });

        assert!(matches!(rx.await.unwrap(), Err(TransportError::Deserialization(_))));
    }

    #[tokio::test]
    async fn test_publish_failure_reaches_callback() {
        let broker = InMemoryBroker::new();
        let (client, connection) = client(&broker, Duration::from_secs(5));
        connection.connect().await.unwrap();
        broker.set_publish_failure(true);

        let (tx, rx) = oneshot::channel();
        client
            .publish("order.create", &json!({}), move |result| {
                let _ = tx.send(result);
            })
            .await;

        assert!(matches!(rx.await.unwrap(), Err(TransportError::NatsPublish(_))));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_expires_abandoned_commands() {
        let broker = InMemoryBroker::new();
        let (client, connection) = client(&broker, Duration::from_millis(50));
        connection.connect().await.unwrap();

        let (tx, rx) = oneshot::channel();
        client
            .publish("order.create", &json!({}), move |result| {
                let _ = tx.send(result);
            })
            .await;
        assert_eq!(client.pending_count(), 1);

        let result = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_client_releases_reply_subscription() {
        let broker = InMemoryBroker::new();
        let (client, connection) = client(&broker, Duration::from_secs(1));
        connection.connect().await.unwrap();

        client.listen().await.unwrap();
        assert_eq!(broker.subscription_count(), 1);

        let (tx, rx) = oneshot::channel();
        let pending = client
            .publish("order.create", &json!({}), move |result| {
                let _ = tx.send(result);
            })
            .await;
        drop(pending);
        drop(client);

        // The abandoned command learns the client is gone
        assert_eq!(rx.await.unwrap(), Err(TransportError::Closed));
        assert!(broker.wait_until(Duration::from_secs(2), |b| b.subscription_count() == 0).await);
    }

    #[tokio::test]
    async fn test_send_times_out() {
        let broker = InMemoryBroker::new();
        let (client, connection) = client(&broker, Duration::from_millis(50));
        connection.connect().await.unwrap();

        let result = client.send("order.create", &json!({})).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert_eq!(client.pending_count(), 0);
    }
}
