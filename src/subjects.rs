// Copyright (c) 2025 - Cowboy AI, Inc.

//! NATS subject hierarchy for service commands and events
//!
//! Every message a service consumes lives under a deterministic subject:
//!
//! ```text
//! {service}.{kind}.{pattern}
//! ```
//!
//! where `kind` is `command` or `event` and `pattern` is the short name the
//! application registered its handler under. The mapping is built once per
//! service and used in both directions:
//!
//! - Producing: `(kind, pattern)` → full subject
//! - Consuming: full subject → `(kind, pattern)`
//!
//! The same space derives the topic log name, the durable consumer name and
//! the filter subject (`{service}.{kind}.>`) for each kind, so logs of one
//! kind or service never capture another's messages.
//!
//! # Examples
//!
//! ```rust
//! use cim_transport::subjects::{MessageKind, SubjectSpace};
//!
//! let space = SubjectSpace::new("orders").unwrap();
//! let subject = space.subject(MessageKind::Command, "order.create");
//! assert_eq!(subject, "orders.command.order.create");
//!
//! let route = space.route(&subject).unwrap();
//! assert_eq!(route.kind, MessageKind::Command);
//! assert_eq!(route.pattern, "order.create");
//!
//! assert_eq!(space.filter(MessageKind::Event), "orders.event.>");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{TransportError, TransportResult};

/// The two kinds of messages carried by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Fire-and-forget notification
    Event,
    /// Request that expects a reply
    Command,
}

impl MessageKind {
    /// Both kinds, events first
    pub const ALL: [MessageKind; 2] = [MessageKind::Event, MessageKind::Command];

    /// Subject token for this kind
    pub fn token(&self) -> &'static str {
        match self {
            MessageKind::Event => "event",
            MessageKind::Command => "command",
        }
    }

    fn log_suffix(&self) -> &'static str {
        match self {
            MessageKind::Event => "EVENTS",
            MessageKind::Command => "COMMANDS",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// A subject resolved back to the kind and pattern it was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route<'a> {
    pub kind: MessageKind,
    pub pattern: &'a str,
}

/// Typed two-way mapping between `(kind, pattern)` and full subjects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectSpace {
    service: String,
    event_prefix: String,
    command_prefix: String,
}

impl SubjectSpace {
    /// Build the subject space for a service
    ///
    /// The service name becomes a subject token and the stem of the log and
    /// consumer names, so it must be non-empty and use only lowercase ASCII
    /// letters, digits, `-` and `_`.
    pub fn new(service: impl Into<String>) -> TransportResult<Self> {
        let service = service.into();
        validate_token(&service)?;

        Ok(Self {
            event_prefix: format!("{}.{}.", service, MessageKind::Event),
            command_prefix: format!("{}.{}.", service, MessageKind::Command),
            service,
        })
    }

    /// The service name this space belongs to
    pub fn service(&self) -> &str {
        &self.service
    }

    fn prefix(&self, kind: MessageKind) -> &str {
        match kind {
            MessageKind::Event => &self.event_prefix,
            MessageKind::Command => &self.command_prefix,
        }
    }

    /// Full subject for a pattern: `{service}.{kind}.{pattern}`
    pub fn subject(&self, kind: MessageKind, pattern: &str) -> String {
        format!("{}{}", self.prefix(kind), pattern)
    }

    /// Recover the kind and registered pattern from a full subject
    ///
    /// Returns `None` for subjects outside this service's space or with an
    /// empty pattern.
    pub fn route<'a>(&self, subject: &'a str) -> Option<Route<'a>> {
        MessageKind::ALL.into_iter().find_map(|kind| {
            subject
                .strip_prefix(self.prefix(kind))
                .filter(|pattern| !pattern.is_empty())
                .map(|pattern| Route { kind, pattern })
        })
    }

    /// Filter subject captured by the kind's topic log: `{service}.{kind}.>`
    pub fn filter(&self, kind: MessageKind) -> String {
        format!("{}>", self.prefix(kind))
    }

    /// Deterministic topic log name, e.g. `ORDERS_COMMANDS`
    pub fn log_name(&self, kind: MessageKind) -> String {
        format!("{}_{}", self.service.to_uppercase(), kind.log_suffix())
    }

    /// Deterministic durable consumer name, e.g. `orders-command`
    ///
    /// Restarted instances reattach to the same consumer by this name.
    pub fn durable_name(&self, kind: MessageKind) -> String {
        format!("{}-{}", self.service, kind)
    }

    /// Per-client reply subject: `{service}.reply.{client_id}`
    pub fn reply_subject(&self, client_id: &str) -> String {
        format!("{}.reply.{}", self.service, client_id)
    }
}

fn validate_token(token: &str) -> TransportResult<()> {
    if token.is_empty() {
        return Err(TransportError::Configuration(
            "service name must not be empty".to_string(),
        ));
    }

    // Log names upper-case the service, so the alphabet must stay one-to-one
    if !token
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(TransportError::Configuration(format!(
            "service name '{}' may only contain lowercase letters, digits, '-' and '_'",
            token
        )));
    }

    Ok(())
}
