// Copyright (c) 2025 - Cowboy AI, Inc.
//! Handler registration and subject routing
//!
//! The application registers handlers under short patterns in a
//! [`HandlerRegistry`]. The transport wraps it in a [`PatternRegistry`]
//! together with its [`SubjectSpace`], once per instance, and never mutates
//! it afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{TransportError, TransportResult};
use crate::handler::{CommandHandler, EventHandler, Handler};
use crate::subjects::{MessageKind, SubjectSpace};

/// Handlers keyed by kind and pattern
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(MessageKind, String), Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command handler; fails if the pattern is taken
    pub fn register_command(
        &mut self,
        pattern: impl Into<String>,
        handler: impl CommandHandler + 'static,
    ) -> TransportResult<()> {
        self.insert(pattern.into(), Handler::Command(Arc::new(handler)))
    }

    /// Register an event handler; fails if the pattern is taken
    pub fn register_event(
        &mut self,
        pattern: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) -> TransportResult<()> {
        self.insert(pattern.into(), Handler::Event(Arc::new(handler)))
    }

    /// Builder form of [`register_command`](Self::register_command)
    pub fn with_command(
        mut self,
        pattern: impl Into<String>,
        handler: impl CommandHandler + 'static,
    ) -> TransportResult<Self> {
        self.register_command(pattern, handler)?;
        Ok(self)
    }

    /// Builder form of [`register_event`](Self::register_event)
    pub fn with_event(
        mut self,
        pattern: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) -> TransportResult<Self> {
        self.register_event(pattern, handler)?;
        Ok(self)
    }

    fn insert(&mut self, pattern: String, handler: Handler) -> TransportResult<()> {
        let kind = handler.kind();
        if pattern.is_empty() {
            return Err(TransportError::Configuration(format!(
                "{} handler pattern must not be empty",
                kind
            )));
        }

        let key = (kind, pattern);
        if self.handlers.contains_key(&key) {
            return Err(TransportError::DuplicateHandler {
                kind: kind.to_string(),
                pattern: key.1,
            });
        }

        self.handlers.insert(key, handler);
        Ok(())
    }

    /// Whether any handler of `kind` is registered
    pub fn handles(&self, kind: MessageKind) -> bool {
        self.handlers.keys().any(|(k, _)| *k == kind)
    }

    /// Registered patterns of one kind, sorted
    pub fn patterns(&self, kind: MessageKind) -> Vec<&str> {
        let mut patterns: Vec<&str> = self
            .handlers
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, pattern)| pattern.as_str())
            .collect();
        patterns.sort_unstable();
        patterns
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A handler found for a subject
#[derive(Debug, Clone)]
pub struct ResolvedHandler {
    pub kind: MessageKind,
    pub pattern: String,
    pub handler: Handler,
}

/// Routes full subjects to registered handlers
pub struct PatternRegistry {
    subjects: SubjectSpace,
    handlers: HandlerRegistry,
}

impl PatternRegistry {
    pub fn new(subjects: SubjectSpace, handlers: HandlerRegistry) -> Self {
        Self { subjects, handlers }
    }

    /// Handler for a full subject, or `None` when nothing is registered
    pub fn get_handler(&self, subject: &str) -> Option<ResolvedHandler> {
        let route = self.subjects.route(subject)?;
        self.handlers
            .handlers
            .get(&(route.kind, route.pattern.to_string()))
            .map(|handler| ResolvedHandler {
                kind: route.kind,
                pattern: route.pattern.to_string(),
                handler: handler.clone(),
            })
    }

    pub fn handles(&self, kind: MessageKind) -> bool {
        self.handlers.handles(kind)
    }

    pub fn subjects(&self) -> &SubjectSpace {
        &self.subjects
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }
}
