// Copyright (c) 2025 - Cowboy AI, Inc.
//! Message dispatch and acknowledgment
//!
//! Every fetched message ends in exactly one resolution. The dispatcher
//! consumes the delivery when resolving it, so nothing else can resolve it
//! again.
//!
//! | kind | condition | resolution |
//! |---|---|---|
//! | any | no handler, undecodable payload | term |
//! | command | missing `reply-to` or `correlation-id` | term |
//! | command | handler returns in time | reply, ack |
//! | command | handler fails or panics | `{"error": ..}` reply, term |
//! | command | handler exceeds the command timeout | no reply, term |
//! | event | first `Ok` emission (or no emission at all) | ack |
//! | event | failure or panic before the first emission | nak |
//! | event | failure after ack | logged only |
//!
//! Commands are never redelivered: running a non-idempotent command twice on
//! different replicas is worse than a lost reply, and the caller decides
//! whether to retry. Events are redelivered until some replica takes them.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broker::{Broker, Delivery, MessageHeaders, Resolution};
use crate::handler::{CommandHandler, EventHandler, Handler, MessageContext};
use crate::registry::PatternRegistry;

pub struct Dispatcher {
    registry: Arc<PatternRegistry>,
    broker: Arc<dyn Broker>,
    command_timeout: Duration,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// `shutdown` stops event work that continues after acknowledgment
    pub fn new(
        registry: Arc<PatternRegistry>,
        broker: Arc<dyn Broker>,
        command_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            broker,
            command_timeout,
            shutdown,
        }
    }

    /// Route, execute and resolve one fetched message
    ///
    /// Returns the resolution that was issued.
    pub async fn dispatch(&self, delivery: Box<dyn Delivery>) -> Resolution {
        let subject = delivery.subject().to_string();

        let Some(resolved) = self.registry.get_handler(&subject) else {
            warn!(%subject, "No handler registered, discarding message");
            return settle(delivery, Resolution::Term).await;
        };

        let payload: Value = match serde_json::from_slice(delivery.payload()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%subject, error = %e, "Undecodable payload, discarding message");
                return settle(delivery, Resolution::Term).await;
            }
        };

        let ctx = MessageContext {
            subject,
            pattern: resolved.pattern,
            kind: resolved.kind,
            headers: delivery.headers().clone(),
            delivered: delivery.delivered(),
        };

        debug!(subject = %ctx.subject, kind = %ctx.kind, delivered = ctx.delivered, "Dispatching message");

        match resolved.handler {
            Handler::Command(handler) => self.dispatch_command(delivery, handler, payload, ctx).await,
            Handler::Event(handler) => self.dispatch_event(delivery, handler, payload, ctx).await,
        }
    }

    /// Resolve a message that will not be dispatched
    ///
    /// Used for messages fetched but still queued at shutdown.
    pub async fn release(&self, delivery: Box<dyn Delivery>) -> Resolution {
        debug!(subject = %delivery.subject(), "Releasing undispatched message");
        settle(delivery, Resolution::Nak).await
    }

    async fn dispatch_command(
        &self,
        delivery: Box<dyn Delivery>,
        handler: Arc<dyn CommandHandler>,
        payload: Value,
        ctx: MessageContext,
    ) -> Resolution {
        let (Some(reply_to), Some(correlation_id)) =
            (ctx.headers.reply_to.clone(), ctx.headers.correlation_id.clone())
        else {
            warn!(subject = %ctx.subject, "Command without reply-to or correlation-id, discarding");
            return settle(delivery, Resolution::Term).await;
        };

        let subject = ctx.subject.clone();
        let invocation = AssertUnwindSafe(handler.handle(payload, ctx)).catch_unwind();

        match tokio::time::timeout(self.command_timeout, invocation).await {
            Ok(Ok(Ok(reply))) => {
                self.reply(&reply_to, &correlation_id, &reply).await;
                settle(delivery, Resolution::Ack).await
            }
            Ok(Ok(Err(e))) => {
                warn!(%subject, %correlation_id, error = %e, "Command handler failed");
                self.reply(&reply_to, &correlation_id, &json!({ "error": e.message() }))
                    .await;
                settle(delivery, Resolution::Term).await
            }
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!(%subject, %correlation_id, panic = %message, "Command handler panicked");
                self.reply(&reply_to, &correlation_id, &json!({ "error": message }))
                    .await;
                settle(delivery, Resolution::Term).await
            }
            Err(_) => {
                warn!(
                    %subject,
                    %correlation_id,
                    timeout = ?self.command_timeout,
                    "Command handler timed out, discarding without reply"
                );
                settle(delivery, Resolution::Term).await
            }
        }
    }

    async fn dispatch_event(
        &self,
        delivery: Box<dyn Delivery>,
        handler: Arc<dyn EventHandler>,
        payload: Value,
        ctx: MessageContext,
    ) -> Resolution {
        let subject = ctx.subject.clone();

        let emissions = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(payload, ctx))) {
            Ok(emissions) => emissions,
            Err(panic) => {
                error!(%subject, panic = %panic_message(panic.as_ref()), "Event handler panicked");
                return settle(delivery, Resolution::Nak).await;
            }
        };
        let mut emissions = AssertUnwindSafe(emissions).catch_unwind();

        let first = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                return self.release(delivery).await;
            }
            first = emissions.next() => first,
        };

        match first {
            None => {
                debug!(%subject, "Event handler finished without emitting");
                return settle(delivery, Resolution::Ack).await;
            }
            Some(Ok(Ok(_))) => {}
            Some(Ok(Err(e))) => {
                warn!(%subject, error = %e, "Event handler failed, requesting redelivery");
                return settle(delivery, Resolution::Nak).await;
            }
            Some(Err(panic)) => {
                error!(%subject, panic = %panic_message(panic.as_ref()), "Event handler panicked, requesting redelivery");
                return settle(delivery, Resolution::Nak).await;
            }
        }

        let resolution = settle(delivery, Resolution::Ack).await;

        // Ownership has moved to this replica; the rest of the work runs on
        let drain = async {
            while let Some(next) = emissions.next().await {
                match next {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        warn!(%subject, error = %e, "Event handler failed after acknowledgment");
                    }
                    Err(panic) => {
                        error!(%subject, panic = %panic_message(panic.as_ref()), "Event handler panicked after acknowledgment");
                    }
                }
            }
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                debug!(%subject, "Shutdown interrupted acknowledged event work");
            }
            _ = drain => {}
        }

        resolution
    }

    async fn reply(&self, reply_to: &str, correlation_id: &str, body: &Value) {
        let payload = match serde_json::to_vec(body) {
            Ok(payload) => payload,
            Err(e) => {
                error!(%reply_to, %correlation_id, error = %e, "Failed to encode command reply");
                return;
            }
        };

        let headers = MessageHeaders::stamped().with_correlation_id(correlation_id);
        if let Err(e) = self
            .broker
            .publish(reply_to, &headers, Bytes::from(payload))
            .await
        {
            error!(%reply_to, %correlation_id, error = %e, "Failed to publish command reply");
        }
    }
}

async fn settle(delivery: Box<dyn Delivery>, resolution: Resolution) -> Resolution {
    let subject = delivery.subject().to_string();
    match delivery.resolve(resolution).await {
        Ok(()) => debug!(%subject, %resolution, "Message resolved"),
        Err(e) => error!(%subject, %resolution, error = %e, "Failed to resolve message"),
    }
    resolution
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let caught = std::panic::catch_unwind(|| panic!("inventory exhausted")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "inventory exhausted");

        let caught = std::panic::catch_unwind(|| panic!("order {} missing", 7)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "order 7 missing");

        let caught = std::panic::catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "handler panicked");
    }
}
