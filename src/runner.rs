// Copyright (c) 2025 - Cowboy AI, Inc.
//! Pull runner
//!
//! One long-lived loop per durable consumer: pull continuously, hand every
//! message to the [`Dispatcher`] on its own task, and start a new pull after
//! a short pause whenever the current one ends or fails. The loop only stops
//! when its cancellation token fires; it then stops pulling, releases queued
//! messages and waits for in-flight dispatches.
//!
//! The runner never resolves a message itself, except through
//! [`Dispatcher::release`] for messages that never got a dispatch slot.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Delivery, FetchOptions};
use crate::dispatcher::Dispatcher;
use crate::subjects::MessageKind;

pub struct PullRunner {
    broker: Arc<dyn Broker>,
    dispatcher: Arc<Dispatcher>,
    kind: MessageKind,
    log_name: String,
    durable_name: String,
    options: FetchOptions,
    restart_delay: Duration,
    limit: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
}

impl PullRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn Broker>,
        dispatcher: Arc<Dispatcher>,
        kind: MessageKind,
        log_name: impl Into<String>,
        durable_name: impl Into<String>,
        options: FetchOptions,
        restart_delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            broker,
            dispatcher,
            kind,
            log_name: log_name.into(),
            durable_name: durable_name.into(),
            options,
            restart_delay,
            limit: None,
            shutdown,
        }
    }

    /// Dispatch at most `limit` messages at a time
    pub fn with_concurrency_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit.map(|limit| Arc::new(Semaphore::new(limit)));
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until cancelled
    pub async fn run(self) {
        info!(
            kind = %self.kind,
            stream = %self.log_name,
            consumer = %self.durable_name,
            "Pull runner started"
        );

        let mut tasks = JoinSet::new();

        while !self.shutdown.is_cancelled() {
            match self
                .broker
                .fetch(&self.log_name, &self.durable_name, self.options)
                .await
            {
                Ok(mut messages) => loop {
                    let next = tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        next = messages.next() => next,
                    };

                    match next {
                        Some(Ok(delivery)) => self.hand_off(&mut tasks, delivery),
                        Some(Err(e)) => {
                            warn!(consumer = %self.durable_name, error = %e, "Pull failed, restarting");
                            break;
                        }
                        None => {
                            debug!(consumer = %self.durable_name, "Pull stream ended, restarting");
                            break;
                        }
                    }

                    while let Some(finished) = tasks.try_join_next() {
                        report(finished);
                    }
                },
                Err(e) => {
                    error!(consumer = %self.durable_name, error = %e, "Failed to start pull");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
        }

        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(consumer = %self.durable_name, in_flight, "Waiting for in-flight dispatches");
        }
        while let Some(finished) = tasks.join_next().await {
            report(finished);
        }

        info!(kind = %self.kind, consumer = %self.durable_name, "Pull runner stopped");
    }

    fn hand_off(&self, tasks: &mut JoinSet<()>, delivery: Box<dyn Delivery>) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let limit = self.limit.clone();
        let shutdown = self.shutdown.clone();

        tasks.spawn(async move {
            let _permit = match limit {
                Some(semaphore) => {
                    let acquired = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };
                    match acquired {
                        Some(permit) => Some(permit),
                        None => {
                            dispatcher.release(delivery).await;
                            return;
                        }
                    }
                }
                None => None,
            };

            dispatcher.dispatch(delivery).await;
        });
    }
}

fn report(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        if e.is_panic() {
            error!(error = %e, "Dispatch task panicked");
        }
    }
}
