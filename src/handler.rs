// Copyright (c) 2025 - Cowboy AI, Inc.
//! Application handler contract
//!
//! Handlers receive the decoded JSON payload and a [`MessageContext`].
//!
//! - A [`CommandHandler`] resolves to a single reply value.
//! - An [`EventHandler`] returns a stream of emissions. The first emission
//!   marks the event as taken; whatever the stream does afterwards is the
//!   handler's own business.
//!
//! Closures can be used directly through [`command_fn`], [`event_fn`] and
//! [`event_stream_fn`].
//!
//! ```rust
//! use cim_transport::handler::{command_fn, event_fn, HandlerResult};
//! use serde_json::{json, Value};
//!
//! let create = command_fn(|payload: Value, _ctx| async move {
//!     let name = payload["name"].as_str().unwrap_or_default().to_string();
//!     HandlerResult::Ok(json!({ "created": name }))
//! });
//!
//! let audit = event_fn(|payload: Value, ctx| async move {
//!     tracing::info!(subject = %ctx.subject, "audit {}", payload);
//!     HandlerResult::Ok(Value::Null)
//! });
//! # let _ = (create, audit);
//! ```

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::broker::MessageHeaders;
use crate::errors::TransportError;
use crate::subjects::MessageKind;

/// What a handler knows about the message it is processing
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContext {
    /// Full subject the message arrived on
    pub subject: String,
    /// Pattern the handler was registered under
    pub pattern: String,
    pub kind: MessageKind,
    pub headers: MessageHeaders,
    /// Delivery attempt, starting at 1
    pub delivered: u64,
}

/// Failure reported by application code
///
/// The message is sent back to command callers as `{"error": message}`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<TransportError> for HandlerError {
    fn from(err: TransportError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

impl From<HandlerError> for TransportError {
    fn from(err: HandlerError) -> Self {
        TransportError::Handler(err.message)
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;

/// Emissions of an event handler
pub type EventEmissions = BoxStream<'static, HandlerResult<Value>>;

/// Handles commands and produces the reply
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, payload: Value, ctx: MessageContext) -> HandlerResult<Value>;
}

/// Handles events
pub trait EventHandler: Send + Sync {
    /// Start handling an event
    ///
    /// The event is acknowledged on the first `Ok` emission. An `Err` before
    /// that requests redelivery; a stream that ends without emitting counts
    /// as handled.
    fn handle(&self, payload: Value, ctx: MessageContext) -> EventEmissions;
}

/// A registered handler of either kind
#[derive(Clone)]
pub enum Handler {
    Command(Arc<dyn CommandHandler>),
    Event(Arc<dyn EventHandler>),
}

impl Handler {
    pub fn kind(&self) -> MessageKind {
        match self {
            Handler::Command(_) => MessageKind::Command,
            Handler::Event(_) => MessageKind::Event,
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handler::{:?}", self.kind())
    }
}

/// Command handler backed by an async closure
pub struct FnCommandHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> CommandHandler for FnCommandHandler<F>
where
    F: Fn(Value, MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
{
    async fn handle(&self, payload: Value, ctx: MessageContext) -> HandlerResult<Value> {
        (self.f)(payload, ctx).await
    }
}

pub fn command_fn<F, Fut>(f: F) -> FnCommandHandler<F>
where
    F: Fn(Value, MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
{
    FnCommandHandler { f }
}

/// Event handler backed by an async closure; its result is the single emission
pub struct FnEventHandler<F> {
    f: F,
}

impl<F, Fut> EventHandler for FnEventHandler<F>
where
    F: Fn(Value, MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
{
    fn handle(&self, payload: Value, ctx: MessageContext) -> EventEmissions {
        stream::once((self.f)(payload, ctx)).boxed()
    }
}

pub fn event_fn<F, Fut>(f: F) -> FnEventHandler<F>
where
    F: Fn(Value, MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
{
    FnEventHandler { f }
}

/// Event handler backed by a closure returning a stream
pub struct StreamEventHandler<F> {
    f: F,
}

impl<F, S> EventHandler for StreamEventHandler<F>
where
    F: Fn(Value, MessageContext) -> S + Send + Sync,
    S: Stream<Item = HandlerResult<Value>> + Send + 'static,
{
    fn handle(&self, payload: Value, ctx: MessageContext) -> EventEmissions {
        (self.f)(payload, ctx).boxed()
    }
}

pub fn event_stream_fn<F, S>(f: F) -> StreamEventHandler<F>
where
    F: Fn(Value, MessageContext) -> S + Send + Sync,
    S: Stream<Item = HandlerResult<Value>> + Send + 'static,
{
    StreamEventHandler { f }
}
