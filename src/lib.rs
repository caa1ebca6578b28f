//! Command and event transport for the Composable Information Machine
//!
//! Services exchange fire-and-forget events and request/response commands
//! over NATS JetStream. The transport provisions the durable logs and
//! consumers a service needs, pulls continuously, routes each message to the
//! registered handler and resolves it (ack, nak or term) by kind. On the
//! producing side it publishes events and correlates command replies.

pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod consumers;
pub mod dispatcher;
pub mod errors;
pub mod handler;
pub mod logs;
pub mod registry;
pub mod runner;
pub mod status;
pub mod subjects;
pub mod transport;

// Re-export commonly used types
pub use broker::memory::{InMemoryBroker, InMemoryConnector};
pub use broker::nats::{NatsConfig, NatsConnector};
pub use broker::{Broker, Connector, Delivery, MessageHeaders, Resolution};
pub use client::{PendingCommand, TransportClient};
pub use config::{ConsumerSettings, FetchSettings, KindSettings, LogSettings, StorageType, TransportConfig};
pub use errors::{TransportError, TransportResult};
pub use handler::{
    command_fn, event_fn, event_stream_fn, CommandHandler, EventHandler, HandlerError,
    HandlerResult, MessageContext,
};
pub use registry::{HandlerRegistry, PatternRegistry};
pub use status::{ConnectionStatus, StatusBus, StatusEvent, StatusKind};
pub use subjects::{MessageKind, SubjectSpace};
pub use transport::Transport;
