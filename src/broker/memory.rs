// Copyright (c) 2025 - Cowboy AI, Inc.
//! In-process broker
//!
//! Implements the broker capability set with JetStream semantics, without a
//! server:
//!
//! - topic logs capture published subjects by wildcard filter
//! - work-queue retention: acked or terminated messages leave the log
//! - durable pull consumers with explicit ack, nak redelivery bounded by
//!   max deliver, ack-wait expiry and a max ack pending cap
//! - duplicate suppression by message id within the log's window
//! - core publish/subscribe for reply subjects
//!
//! Several [`InMemorySession`]s can share one [`InMemoryBroker`], which is how
//! tests model multiple service replicas on one cluster. Closing a session
//! ends its subscriptions and pulls without affecting the others.
//!
//! The broker keeps an inspection log of publications and resolutions, and
//! offers failure injection (stream interruption, pull and fetch errors,
//! publish failures, slow consumer creation, connect failures).

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

use super::{
    subject_matches, Broker, ConsumerInfo, ConsumerSpec, Connector, Delivery, DeliveryStream,
    FetchOptions, InboundMessage, InboundStream, LogInfo, LogSpec, MessageHeaders, Resolution,
    RetentionPolicy,
};
use crate::errors::{TransportError, TransportResult};
use crate::status::{StatusBus, StatusEvent};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A message published through the broker
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub subject: String,
    pub headers: MessageHeaders,
    pub payload: Bytes,
    pub published_at: DateTime<Utc>,
}

impl PublishedMessage {
    /// Decode the payload as JSON
    pub fn json(&self) -> TransportResult<serde_json::Value> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| TransportError::Deserialization(e.to_string()))
    }
}

/// A terminal resolution issued for a fetched message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionRecord {
    pub log_name: String,
    pub sequence: u64,
    pub subject: String,
    pub resolution: Resolution,
    pub delivered: u64,
}

/// Counters for provisioning calls that reached the broker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningStats {
    pub logs_created: usize,
    pub log_updates: usize,
    pub consumers_created: usize,
    pub consumer_conflicts: usize,
}

struct StoredMessage {
    subject: String,
    headers: MessageHeaders,
    payload: Bytes,
}

struct InFlight {
    delivered: u64,
    since: Instant,
}

struct ConsumerState {
    spec: ConsumerSpec,
    cursor: u64,
    in_flight: HashMap<u64, InFlight>,
    redeliver: VecDeque<(u64, u64)>,
}

impl ConsumerState {
    fn may_redeliver(&self, delivered: u64) -> bool {
        self.spec.max_deliver <= 0 || delivered < self.spec.max_deliver as u64
    }

    fn is_full(&self) -> bool {
        self.spec.max_ack_pending > 0 && self.in_flight.len() as i64 >= self.spec.max_ack_pending
    }

    fn expire(&mut self, now: Instant) {
        let ack_wait = self.spec.ack_wait;
        let expired: Vec<(u64, u64)> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| now.duration_since(flight.since) >= ack_wait)
            .map(|(seq, flight)| (*seq, flight.delivered))
            .collect();

        for (seq, delivered) in expired {
            self.in_flight.remove(&seq);
            if self.may_redeliver(delivered) {
                self.redeliver.push_back((seq, delivered));
            }
        }
    }
}

struct LogState {
    spec: LogSpec,
    next_seq: u64,
    messages: BTreeMap<u64, StoredMessage>,
    consumers: HashMap<String, ConsumerState>,
    recent_ids: HashMap<String, Instant>,
}

impl LogState {
    fn info(&self) -> LogInfo {
        LogInfo {
            name: self.spec.name.clone(),
            subjects: self.spec.subjects.clone(),
            messages: self.messages.len() as u64,
        }
    }

    fn captures(&self, subject: &str) -> bool {
        self.spec
            .subjects
            .iter()
            .any(|filter| subject_matches(filter, subject))
    }

    fn consumer_info(&self, durable_name: &str) -> Option<ConsumerInfo> {
        self.consumers.get(durable_name).map(|consumer| ConsumerInfo {
            log_name: self.spec.name.clone(),
            durable_name: durable_name.to_string(),
            filter_subject: consumer.spec.filter_subject.clone(),
            pending: self
                .messages
                .range(consumer.cursor + 1..)
                .filter(|(_, m)| subject_matches(&consumer.spec.filter_subject, &m.subject))
                .count() as u64,
            ack_pending: consumer.in_flight.len() as u64,
        })
    }

    fn remove_on_resolution(&mut self, seq: u64) {
        if self.spec.retention == RetentionPolicy::WorkQueue {
            self.messages.remove(&seq);
        }
    }
}

struct CoreSubscription {
    session: u64,
    filter: String,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Default)]
struct State {
    logs: HashMap<String, LogState>,
    subscriptions: Vec<CoreSubscription>,
    published: Vec<PublishedMessage>,
    resolutions: Vec<ResolutionRecord>,
    stats: ProvisioningStats,
    fetch_epoch: u64,
    fetch_calls: usize,
    fetch_failures: VecDeque<TransportError>,
    pull_error: Option<(u64, TransportError)>,
    fail_publish: bool,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    next_session: AtomicU64,
    consumer_create_delay: Mutex<Option<Duration>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared in-process broker state
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                next_session: AtomicU64::new(1),
                consumer_create_delay: Mutex::new(None),
            }),
        }
    }

    /// Open a new client session on this broker
    pub fn session(&self) -> InMemorySession {
        InMemorySession {
            shared: Arc::clone(&self.shared),
            id: self.shared.next_session.fetch_add(1, Ordering::Relaxed),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Every message published so far
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state().published.clone()
    }

    /// Messages published on exactly `subject`
    pub fn published_on(&self, subject: &str) -> Vec<PublishedMessage> {
        self.shared
            .state()
            .published
            .iter()
            .filter(|m| m.subject == subject)
            .cloned()
            .collect()
    }

    /// Every resolution issued so far
    pub fn resolutions(&self) -> Vec<ResolutionRecord> {
        self.shared.state().resolutions.clone()
    }

    /// Resolutions issued for messages on `subject`
    pub fn resolutions_for(&self, subject: &str) -> Vec<Resolution> {
        self.shared
            .state()
            .resolutions
            .iter()
            .filter(|r| r.subject == subject)
            .map(|r| r.resolution)
            .collect()
    }

    /// Provisioning calls that reached the broker
    pub fn stats(&self) -> ProvisioningStats {
        self.shared.state().stats.clone()
    }

    /// Names of all topic logs
    pub fn log_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.state().logs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of all durable consumers on a log
    pub fn consumer_names(&self, log_name: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .state()
            .logs
            .get(log_name)
            .map(|log| log.consumers.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Number of messages currently stored in a log
    pub fn stored_messages(&self, log_name: &str) -> usize {
        self.shared
            .state()
            .logs
            .get(log_name)
            .map(|log| log.messages.len())
            .unwrap_or(0)
    }

    /// End every running pull, as a broker restart would
    pub fn interrupt_fetches(&self) {
        self.shared.state().fetch_epoch += 1;
        self.shared.notify.notify_waiters();
    }

    /// Make the next call to `fetch` fail with `error`
    ///
    /// Calls queue up: each one fails exactly one later fetch.
    pub fn fail_next_fetch(&self, error: TransportError) {
        self.shared.state().fetch_failures.push_back(error);
    }

    /// Make every running pull yield `error` once
    pub fn inject_fetch_error(&self, error: TransportError) {
        {
            let mut state = self.shared.state();
            let generation = state.pull_error.as_ref().map_or(0, |(g, _)| *g) + 1;
            state.pull_error = Some((generation, error));
        }
        self.shared.notify.notify_waiters();
    }

    /// Number of `fetch` calls so far, failed ones included
    pub fn fetch_calls(&self) -> usize {
        self.shared.state().fetch_calls
    }

    /// Core subscriptions whose receiver is still alive
    pub fn subscription_count(&self) -> usize {
        let mut state = self.shared.state();
        state.subscriptions.retain(|sub| !sub.sender.is_closed());
        state.subscriptions.len()
    }

    /// Make every publish fail until cleared
    pub fn set_publish_failure(&self, fail: bool) {
        self.shared.state().fail_publish = fail;
    }

    /// Delay consumer creation, widening the window for creation races
    pub fn set_consumer_create_delay(&self, delay: Option<Duration>) {
        *self
            .shared
            .consumer_create_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Poll until `condition` holds or `timeout` passes
    pub async fn wait_until<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&InMemoryBroker) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// One client session on an [`InMemoryBroker`]
pub struct InMemorySession {
    shared: Arc<Shared>,
    id: u64,
    closed: Arc<AtomicBool>,
}

impl InMemorySession {
    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn shut(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared
            .state()
            .subscriptions
            .retain(|sub| sub.session != self.id);
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl Broker for InMemorySession {
    async fn publish(
        &self,
        subject: &str,
        headers: &MessageHeaders,
        payload: Bytes,
    ) -> TransportResult<()> {
        self.ensure_open()?;

        {
            let mut state = self.shared.state();
            if state.fail_publish {
                return Err(TransportError::NatsPublish(format!(
                    "publish to {} rejected",
                    subject
                )));
            }

            state.published.push(PublishedMessage {
                subject: subject.to_string(),
                headers: headers.clone(),
                payload: payload.clone(),
                published_at: Utc::now(),
            });

            let inbound = InboundMessage {
                subject: subject.to_string(),
                headers: headers.clone(),
                payload: payload.clone(),
            };
            state.subscriptions.retain(|sub| {
                !subject_matches(&sub.filter, subject)
                    || sub.sender.unbounded_send(inbound.clone()).is_ok()
            });

            let now = Instant::now();
            for log in state.logs.values_mut().filter(|log| log.captures(subject)) {
                let window = log.spec.duplicate_window;
                log.recent_ids
                    .retain(|_, seen| now.duration_since(*seen) < window);

                if let Some(id) = &headers.message_id {
                    if log.recent_ids.contains_key(id) {
                        debug!(log = %log.spec.name, message_id = %id, "Duplicate message dropped");
                        continue;
                    }
                    log.recent_ids.insert(id.clone(), now);
                }

                log.next_seq += 1;
                let seq = log.next_seq;
                log.messages.insert(
                    seq,
                    StoredMessage {
                        subject: subject.to_string(),
                        headers: headers.clone(),
                        payload: payload.clone(),
                    },
                );
            }
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> TransportResult<InboundStream> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded();

        self.shared.state().subscriptions.push(CoreSubscription {
            session: self.id,
            filter: subject.to_string(),
            sender,
        });

        Ok(receiver.boxed())
    }

    async fn log_info(&self, name: &str) -> TransportResult<LogInfo> {
        self.ensure_open()?;
        self.shared
            .state()
            .logs
            .get(name)
            .map(LogState::info)
            .ok_or_else(|| TransportError::LogNotFound(name.to_string()))
    }

    async fn create_log(&self, spec: &LogSpec) -> TransportResult<LogInfo> {
        self.ensure_open()?;
        let mut state = self.shared.state();

        if let Some(existing) = state.logs.get(&spec.name) {
            // Same definition is a no-op, like JetStream
            if existing.spec == *spec {
                return Ok(existing.info());
            }
            return Err(TransportError::Provisioning(format!(
                "stream name already in use with a different configuration: {}",
                spec.name
            )));
        }

        let log = LogState {
            spec: spec.clone(),
            next_seq: 0,
            messages: BTreeMap::new(),
            consumers: HashMap::new(),
            recent_ids: HashMap::new(),
        };
        let info = log.info();
        state.logs.insert(spec.name.clone(), log);
        state.stats.logs_created += 1;
        Ok(info)
    }

    async fn update_log_subjects(&self, name: &str, subjects: &[String]) -> TransportResult<LogInfo> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        let log = state
            .logs
            .get_mut(name)
            .ok_or_else(|| TransportError::LogNotFound(name.to_string()))?;

        log.spec.subjects = subjects.to_vec();
        let info = log.info();
        state.stats.log_updates += 1;
        Ok(info)
    }

    async fn consumer_info(&self, log_name: &str, durable_name: &str) -> TransportResult<ConsumerInfo> {
        self.ensure_open()?;
        let state = self.shared.state();
        let log = state
            .logs
            .get(log_name)
            .ok_or_else(|| TransportError::LogNotFound(log_name.to_string()))?;

        log.consumer_info(durable_name)
            .ok_or_else(|| TransportError::ConsumerNotFound(durable_name.to_string()))
    }

    async fn create_consumer(&self, log_name: &str, spec: &ConsumerSpec) -> TransportResult<ConsumerInfo> {
        self.ensure_open()?;

        let delay = *self
            .shared
            .consumer_create_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.shared.state();
        let state = &mut *state;
        let log = state
            .logs
            .get_mut(log_name)
            .ok_or_else(|| TransportError::LogNotFound(log_name.to_string()))?;

        if let Some(existing) = log.consumers.get(&spec.durable_name) {
            // Same definition is a no-op, like JetStream
            if existing.spec == *spec {
                return log
                    .consumer_info(&spec.durable_name)
                    .ok_or_else(|| TransportError::ConsumerNotFound(spec.durable_name.clone()));
            }
            state.stats.consumer_conflicts += 1;
            return Err(TransportError::ConsumerExists(spec.durable_name.clone()));
        }

        log.consumers.insert(
            spec.durable_name.clone(),
            ConsumerState {
                spec: spec.clone(),
                cursor: 0,
                in_flight: HashMap::new(),
                redeliver: VecDeque::new(),
            },
        );
        state.stats.consumers_created += 1;

        log.consumer_info(&spec.durable_name)
            .ok_or_else(|| TransportError::ConsumerNotFound(spec.durable_name.clone()))
    }

    async fn fetch(
        &self,
        log_name: &str,
        durable_name: &str,
        _options: FetchOptions,
    ) -> TransportResult<DeliveryStream> {
        let injected = {
            let mut state = self.shared.state();
            state.fetch_calls += 1;
            state.fetch_failures.pop_front()
        };
        if let Some(error) = injected {
            return Err(error);
        }

        self.consumer_info(log_name, durable_name).await?;

        let (epoch, error_generation) = {
            let state = self.shared.state();
            (
                state.fetch_epoch,
                state.pull_error.as_ref().map_or(0, |(g, _)| *g),
            )
        };
        let pull = Pull {
            shared: Arc::clone(&self.shared),
            closed: Arc::clone(&self.closed),
            log_name: log_name.to_string(),
            durable_name: durable_name.to_string(),
            epoch,
            error_generation,
        };

        Ok(futures::stream::unfold(pull, |mut pull| async move {
            pull.next().await.map(|delivery| (delivery, pull))
        })
        .boxed())
    }

    async fn drain(&self) -> TransportResult<()> {
        self.shut();
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.shut();
        Ok(())
    }
}

enum Next {
    Deliver(MemoryDelivery),
    Fail(TransportError),
    Wait,
    End,
}

struct Pull {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
    log_name: String,
    durable_name: String,
    epoch: u64,
    error_generation: u64,
}

impl Pull {
    async fn next(&mut self) -> Option<TransportResult<Box<dyn Delivery>>> {
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.take() {
                Next::Deliver(delivery) => return Some(Ok(Box::new(delivery))),
                Next::Fail(error) => return Some(Err(error)),
                Next::End => return None,
                Next::Wait => {}
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    fn take(&mut self) -> Next {
        if self.closed.load(Ordering::SeqCst) {
            return Next::End;
        }

        let mut state = self.shared.state();
        if state.fetch_epoch != self.epoch {
            return Next::End;
        }

        if let Some((generation, error)) = &state.pull_error {
            if *generation != self.error_generation {
                self.error_generation = *generation;
                return Next::Fail(error.clone());
            }
        }

        let Some(log) = state.logs.get_mut(&self.log_name) else {
            return Next::End;
        };
        let LogState {
            messages,
            consumers,
            ..
        } = log;
        let Some(consumer) = consumers.get_mut(&self.durable_name) else {
            return Next::End;
        };

        consumer.expire(Instant::now());
        if consumer.is_full() {
            return Next::Wait;
        }

        while let Some((seq, delivered)) = consumer.redeliver.pop_front() {
            if let Some(message) = messages.get(&seq) {
                let delivered = delivered + 1;
                consumer.in_flight.insert(
                    seq,
                    InFlight {
                        delivered,
                        since: Instant::now(),
                    },
                );
                return Next::Deliver(self.delivery(seq, delivered, message));
            }
        }

        let filter = consumer.spec.filter_subject.clone();
        let fresh = messages
            .range(consumer.cursor + 1..)
            .find(|(_, message)| subject_matches(&filter, &message.subject));

        match fresh {
            Some((&seq, message)) => {
                consumer.cursor = seq;
                consumer.in_flight.insert(
                    seq,
                    InFlight {
                        delivered: 1,
                        since: Instant::now(),
                    },
                );
                Next::Deliver(self.delivery(seq, 1, message))
            }
            None => Next::Wait,
        }
    }

    fn delivery(&self, sequence: u64, delivered: u64, message: &StoredMessage) -> MemoryDelivery {
        MemoryDelivery {
            shared: Arc::clone(&self.shared),
            log_name: self.log_name.clone(),
            durable_name: self.durable_name.clone(),
            sequence,
            delivered,
            subject: message.subject.clone(),
            headers: message.headers.clone(),
            payload: message.payload.clone(),
        }
    }
}

/// A message fetched from an in-memory durable consumer
pub struct MemoryDelivery {
    shared: Arc<Shared>,
    log_name: String,
    durable_name: String,
    sequence: u64,
    delivered: u64,
    subject: String,
    headers: MessageHeaders,
    payload: Bytes,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn delivered(&self) -> u64 {
        self.delivered
    }

    async fn resolve(self: Box<Self>, resolution: Resolution) -> TransportResult<()> {
        {
            let mut state = self.shared.state();
            let state = &mut *state;

            state.resolutions.push(ResolutionRecord {
                log_name: self.log_name.clone(),
                sequence: self.sequence,
                subject: self.subject.clone(),
                resolution,
                delivered: self.delivered,
            });

            let Some(log) = state.logs.get_mut(&self.log_name) else {
                return Err(TransportError::Acknowledgment(format!(
                    "log {} no longer exists",
                    self.log_name
                )));
            };
            let Some(consumer) = log.consumers.get_mut(&self.durable_name) else {
                return Err(TransportError::Acknowledgment(format!(
                    "consumer {} no longer exists",
                    self.durable_name
                )));
            };

            // Late resolution after ack-wait expiry; the broker already moved on
            if consumer.in_flight.remove(&self.sequence).is_none() {
                return Ok(());
            }

            let settled = match resolution {
                Resolution::Nak => {
                    if consumer.may_redeliver(self.delivered) {
                        consumer.redeliver.push_back((self.sequence, self.delivered));
                    }
                    false
                }
                Resolution::Ack | Resolution::Term => true,
            };
            if settled {
                log.remove_on_resolution(self.sequence);
            }
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }
}

/// Connector handing out sessions on a shared [`InMemoryBroker`]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
    failures: Mutex<VecDeque<TransportError>>,
    status: Mutex<Option<StatusBus>>,
    attempts: AtomicUsize,
}

impl InMemoryConnector {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            failures: Mutex::new(VecDeque::new()),
            status: Mutex::new(None),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fail the next connection attempt with `error`
    pub fn fail_next(&self, error: TransportError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Number of connection attempts so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Report a dropped connection on the status bus
    pub fn simulate_disconnect(&self) {
        self.report(StatusEvent::Disconnected);
    }

    /// Report a re-established connection on the status bus
    pub fn simulate_reconnect(&self) {
        self.report(StatusEvent::Reconnected);
    }

    fn report(&self, event: StatusEvent) {
        if let Some(status) = self
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            status.emit(event);
        }
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, status: StatusBus) -> TransportResult<Arc<dyn Broker>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
        Ok(Arc::new(self.broker.session()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KindSettings;
    use pretty_assertions::assert_eq;

    const LOG: &str = "ORDERS_EVENTS";
    const DURABLE: &str = "orders-event";

    fn fetch_options() -> FetchOptions {
        FetchOptions {
            batch_size: 25,
            expires: Duration::from_secs(1),
        }
    }

    async fn provisioned(max_deliver: i64) -> (InMemoryBroker, InMemorySession) {
        let broker = InMemoryBroker::new();
        let session = broker.session();
        let mut settings = KindSettings::events();
        settings.consumer.max_deliver = max_deliver;

        session
            .create_log(&LogSpec::work_queue(LOG, "orders.event.>", &settings.log))
            .await
            .unwrap();
        session
            .create_consumer(
                LOG,
                &ConsumerSpec::durable(DURABLE, "orders.event.>", &settings.consumer),
            )
            .await
            .unwrap();
        (broker, session)
    }

    async fn next(stream: &mut DeliveryStream) -> Box<dyn Delivery> {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery timed out")
            .expect("stream ended")
            .expect("delivery failed")
    }

    #[tokio::test]
    async fn test_ack_removes_from_work_queue() {
        let (broker, session) = provisioned(5).await;
        session
            .publish("orders.event.created", &MessageHeaders::new(), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(broker.stored_messages(LOG), 1);

        let mut stream = session.fetch(LOG, DURABLE, fetch_options()).await.unwrap();
        let delivery = next(&mut stream).await;
        assert_eq!(delivery.subject(), "orders.event.created");
        delivery.resolve(Resolution::Ack).await.unwrap();

        assert_eq!(broker.stored_messages(LOG), 0);
        assert_eq!(broker.resolutions_for("orders.event.created"), vec![Resolution::Ack]);
    }

    #[tokio::test]
    async fn test_nak_redelivers_until_max_deliver() {
        let (broker, session) = provisioned(2).await;
        session
            .publish("orders.event.created", &MessageHeaders::new(), Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let mut stream = session.fetch(LOG, DURABLE, fetch_options()).await.unwrap();
        let first = next(&mut stream).await;
        assert_eq!(first.delivered(), 1);
        first.resolve(Resolution::Nak).await.unwrap();

        let second = next(&mut stream).await;
        assert_eq!(second.delivered(), 2);
        second.resolve(Resolution::Nak).await.unwrap();

        let third = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(third.is_err(), "message must not exceed max deliver");
        assert_eq!(broker.resolutions().len(), 2);
    }

    #[tokio::test]
    async fn test_term_is_never_redelivered() {
        let (broker, session) = provisioned(5).await;
        session
            .publish("orders.event.created", &MessageHeaders::new(), Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let mut stream = session.fetch(LOG, DURABLE, fetch_options()).await.unwrap();
        next(&mut stream).await.resolve(Resolution::Term).await.unwrap();

        let again = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(again.is_err());
        assert_eq!(broker.stored_messages(LOG), 0);
    }

    #[tokio::test]
    async fn test_duplicate_message_ids_are_dropped() {
        let (broker, session) = provisioned(5).await;
        let headers = MessageHeaders::new().with_message_id("m-1");

        for _ in 0..3 {
            session
                .publish("orders.event.created", &headers, Bytes::from_static(b"{}"))
                .await
                .unwrap();
        }

        assert_eq!(broker.stored_messages(LOG), 1);
        assert_eq!(broker.published().len(), 3);
    }

    #[tokio::test]
    async fn test_interrupt_ends_running_pulls() {
        let (broker, session) = provisioned(5).await;
        let mut stream = session.fetch(LOG, DURABLE, fetch_options()).await.unwrap();

        broker.interrupt_fetches();
        let ended = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(ended.is_none());
    }

    #[tokio::test]
    async fn test_core_subscription_and_session_close() {
        let broker = InMemoryBroker::new();
        let listener = broker.session();
        let publisher = broker.session();

        let mut replies = listener.subscribe("orders.reply.*").await.unwrap();
        publisher
            .publish("orders.reply.abc", &MessageHeaders::new(), Bytes::from_static(b"1"))
            .await
            .unwrap();

        let reply = replies.next().await.unwrap();
        assert_eq!(reply.subject, "orders.reply.abc");

        listener.close().await.unwrap();
        assert!(replies.next().await.is_none());
        assert_eq!(
            listener
                .publish("orders.reply.abc", &MessageHeaders::new(), Bytes::new())
                .await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_identical_consumer_create_is_idempotent() {
        let (broker, session) = provisioned(5).await;
        let mut settings = KindSettings::events();
        settings.consumer.max_deliver = 5;
        let spec = ConsumerSpec::durable(DURABLE, "orders.event.>", &settings.consumer);

        let again = session.create_consumer(LOG, &spec).await.unwrap();
        assert_eq!(again.durable_name, DURABLE);

        settings.consumer.max_deliver = 9;
        let changed = ConsumerSpec::durable(DURABLE, "orders.event.>", &settings.consumer);
        assert_eq!(
            session.create_consumer(LOG, &changed).await,
            Err(TransportError::ConsumerExists(DURABLE.into()))
        );

        assert_eq!(broker.stats().consumers_created, 1);
        assert_eq!(broker.stats().consumer_conflicts, 1);
    }

    #[tokio::test]
    async fn test_fetch_failures_are_consumed_in_order() {
        let (broker, session) = provisioned(5).await;
        broker.fail_next_fetch(TransportError::Fetch("no responders".into()));
        broker.fail_next_fetch(TransportError::Fetch("timeout".into()));

        for expected in ["no responders", "timeout"] {
            let result = session.fetch(LOG, DURABLE, fetch_options()).await;
            assert!(matches!(result, Err(TransportError::Fetch(message)) if message == expected));
        }
        assert!(session.fetch(LOG, DURABLE, fetch_options()).await.is_ok());
        assert_eq!(broker.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn test_injected_pull_error_is_yielded_once() {
        let (broker, session) = provisioned(5).await;
        let mut stream = session.fetch(LOG, DURABLE, fetch_options()).await.unwrap();

        broker.inject_fetch_error(TransportError::Fetch("heartbeat missed".into()));
        let failed = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(matches!(failed, Some(Err(TransportError::Fetch(_)))));

        // A pull started afterwards does not see the old error
        let mut fresh = session.fetch(LOG, DURABLE, fetch_options()).await.unwrap();
        session
            .publish("orders.event.created", &MessageHeaders::new(), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let delivery = next(&mut fresh).await;
        assert_eq!(delivery.subject(), "orders.event.created");
    }

    #[tokio::test]
    async fn test_dropped_subscriptions_are_not_counted() {
        let broker = InMemoryBroker::new();
        let session = broker.session();

        let first = session.subscribe("orders.reply.a").await.unwrap();
        let _second = session.subscribe("orders.reply.b").await.unwrap();
        assert_eq!(broker.subscription_count(), 2);

        drop(first);
        assert_eq!(broker.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_connector_replays_injected_failure_once() {
        let connector = InMemoryConnector::new(InMemoryBroker::new());
        connector.fail_next(TransportError::NatsConnection("refused".into()));

        assert!(connector.connect(StatusBus::new()).await.is_err());
        assert!(connector.connect(StatusBus::new()).await.is_ok());
        assert_eq!(connector.attempts(), 2);
    }
}
