//! Messaging transport abstraction
//!
//! - `nats`: production transport backed by `async-nats`
//! - `memory`: in-process broker for tests and offline use

mod memory;
mod nats;

pub use memory::{CallCounts, MemoryBroker, MemoryTransport, MemoryTransportFactory};
pub use nats::{NatsTransport, NatsTransportFactory};

use crate::config::RelayConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("close failed: {0}")]
    Close(String),
}

/// A raw message delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// Inbound messages for one subscription
///
/// Dropping the stream stops delivery at the transport.
pub type InboundStream = Pin<Box<dyn Stream<Item = TransportMessage> + Send>>;

/// Lifecycle notifications emitted by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Error(String),
    SlowConsumer(u64),
    LameDuck,
    /// The transport will not recover; the session is over
    Closed,
}

/// Sink handed to a transport for its lifecycle notifications
///
/// Each sink is stamped with the configuration epoch it was created for so
/// notifications from a replaced transport can be told apart.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    epoch: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEvents {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { epoch, tx }
    }

    /// A sink whose notifications go nowhere
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { epoch: 0, tx }
    }

    /// Emit a notification; silently dropped once the receiver is gone
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send((self.epoch, event));
    }
}

/// The messaging collaborator driven by the connection controller
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a session
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the session
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Start delivery for `subject`, optionally as part of a queue group
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<InboundStream, TransportError>;

    /// Publish `payload` to `subject`
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError>;
}

/// Builds the transport for a configuration
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &RelayConfig, events: TransportEvents) -> Arc<dyn Transport>;
}
