//! Subscription registry
//!
//! Each subscription owns two tasks:
//! - a pump draining the transport stream into an unbounded queue, so the
//!   transport read path never waits on a handler
//! - a dispatcher decoding queued deliveries and running the handler on the
//!   blocking pool, one at a time in arrival order
//!
//! Aborting the pump drops the transport stream, which stops delivery at the
//! transport.

use crate::error::{RelayError, Result};
use crate::transport::{InboundStream, TransportMessage};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Opaque handle identifying one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Snapshot of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub subject: String,
    pub queue_group: Option<String>,
    pub active: bool,
}

/// A decoded inbound delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Subject the message was published to
    pub subject: String,
    /// Reply subject, when the publisher asked for one
    pub reply: Option<String>,
    /// UTF-8 payload
    pub data: String,
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Decode a raw delivery; the payload must be UTF-8
    pub fn decode(raw: TransportMessage) -> Result<Self> {
        let data = String::from_utf8(raw.payload.to_vec()).map_err(|e| {
            RelayError::InvalidMessageFormat(format!(
                "payload on '{}' is not valid UTF-8: {}",
                raw.subject, e
            ))
        })?;

        Ok(Self {
            subject: raw.subject,
            reply: raw.reply,
            data,
            received_at: Utc::now(),
        })
    }

    /// Deserialize the payload as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.data).map_err(|e| RelayError::InvalidMessageFormat(e.to_string()))
    }
}

/// Handler invoked for every delivery of a subscription
pub type MessageHandler = Arc<dyn Fn(Result<Message>) + Send + Sync>;

struct Entry {
    info: Subscription,
    active: Arc<AtomicBool>,
    pump: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Entry {
    fn stop(&mut self) {
        self.info.active = false;
        self.active.store(false, Ordering::SeqCst);
        self.pump.abort();
        self.dispatcher.abort();
    }
}

/// Active subscriptions of one manager
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    next_handle: u64,
    entries: BTreeMap<SubscriptionHandle, Entry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription and start forwarding its deliveries
    pub fn insert(
        &mut self,
        subject: String,
        queue_group: Option<String>,
        stream: InboundStream,
        handler: MessageHandler,
        verbose: bool,
    ) -> SubscriptionHandle {
        self.next_handle += 1;
        let handle = SubscriptionHandle(self.next_handle);
        let active = Arc::new(AtomicBool::new(true));

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(stream, tx));
        let dispatcher = tokio::spawn(dispatch(handle, rx, handler, active.clone(), verbose));

        debug!(%handle, subject = %subject, queue_group = ?queue_group, "Subscription registered");

        self.entries.insert(
            handle,
            Entry {
                info: Subscription {
                    handle,
                    subject,
                    queue_group,
                    active: true,
                },
                active,
                pump,
                dispatcher,
            },
        );

        handle
    }

    /// Stop a subscription; unknown handles are ignored
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> bool {
        match self.entries.remove(&handle) {
            Some(mut entry) => {
                entry.stop();
                debug!(%handle, subject = %entry.info.subject, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Stop every subscription
    pub fn clear(&mut self) {
        for (_, mut entry) in std::mem::take(&mut self.entries) {
            entry.stop();
        }
    }

    pub fn active(&self) -> Vec<Subscription> {
        self.entries.values().map(|e| e.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}

async fn pump(mut stream: InboundStream, tx: mpsc::UnboundedSender<TransportMessage>) {
    while let Some(msg) = stream.next().await {
        if tx.send(msg).is_err() {
            break;
        }
    }
}

async fn dispatch(
    handle: SubscriptionHandle,
    mut rx: mpsc::UnboundedReceiver<TransportMessage>,
    handler: MessageHandler,
    active: Arc<AtomicBool>,
    verbose: bool,
) {
    while let Some(raw) = rx.recv().await {
        if !active.load(Ordering::SeqCst) {
            break;
        }

        if verbose {
            debug!(%handle, subject = %raw.subject, bytes = raw.payload.len(), "Delivering message");
        }

        let result = Message::decode(raw);
        if let Err(e) = &result {
            warn!(%handle, error = %e, "Undecodable delivery");
        }

        let handler = handler.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || handler(result)).await {
            warn!(%handle, error = %e, "Message handler panicked");
        }
    }
}
