//! In-process transport
//!
//! A [`MemoryBroker`] routes messages between every [`MemoryTransport`] attached
//! to it using NATS subject semantics: wildcard patterns, and queue groups where
//! each message goes to exactly one member (round-robin). The broker also counts
//! calls and can inject failures, which makes it the transport used by tests.

use super::{
    InboundStream, Transport, TransportError, TransportEvent, TransportEvents, TransportFactory,
    TransportMessage,
};
use crate::config::RelayConfig;
use crate::subjects::{Subject, SubjectPattern};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// Snapshot of the calls transports made against a broker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connects: usize,
    pub disconnects: usize,
    pub subscribes: usize,
    pub publishes: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.connects + self.disconnects + self.subscribes + self.publishes
    }
}

struct BrokerSubscription {
    id: u64,
    owner: u64,
    pattern: SubjectPattern,
    queue_group: Option<String>,
    tx: mpsc::UnboundedSender<TransportMessage>,
}

#[derive(Default)]
struct Failures {
    connect: Option<String>,
    disconnect: Option<String>,
    subscribe: Option<String>,
    publish: Option<String>,
}

#[derive(Default)]
struct BrokerInner {
    subscriptions: Mutex<Vec<BrokerSubscription>>,
    /// (pattern, queue group) -> next member index
    round_robin: Mutex<HashMap<(String, String), usize>>,
    /// Event sinks of connected transports, by transport id
    sinks: Mutex<BTreeMap<u64, TransportEvents>>,
    failures: Mutex<Failures>,
    connect_delay: Mutex<Option<Duration>>,
    disconnect_delay: Mutex<Option<Duration>>,
    next_id: AtomicU64,
    transports_created: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    subscribes: AtomicUsize,
    publishes: AtomicUsize,
}

impl BrokerInner {
    fn remove_subscription(&self, id: u64) {
        self.subscriptions.lock().retain(|s| s.id != id);
    }
}

/// Shared in-process message router
///
/// Cheaply cloneable; clones share the same routing table.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a message to matching subscribers, returns the number of deliveries
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<usize, TransportError> {
        let parsed = Subject::parse(subject).map_err(|e| TransportError::Publish(e.to_string()))?;
        let msg = TransportMessage {
            subject: subject.to_string(),
            reply: None,
            payload: payload.into(),
        };

        let subs = self.inner.subscriptions.lock();
        let mut delivered = 0;
        let mut groups: BTreeMap<(String, String), Vec<&BrokerSubscription>> = BTreeMap::new();

        for sub in subs.iter().filter(|s| s.pattern.matches(&parsed)) {
            match &sub.queue_group {
                Some(group) => groups
                    .entry((sub.pattern.to_string(), group.clone()))
                    .or_default()
                    .push(sub),
                None => {
                    if sub.tx.send(msg.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }

        if !groups.is_empty() {
            let mut round_robin = self.inner.round_robin.lock();
            for (key, members) in groups {
                let next = round_robin.entry(key).or_insert(0);
                let member = members[*next % members.len()];
                *next = next.wrapping_add(1);
                if member.tx.send(msg.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        debug!(subject = %subject, delivered, "Routed message");
        Ok(delivered)
    }

    /// Send a lifecycle notification to every connected transport
    pub fn emit(&self, event: TransportEvent) {
        for sink in self.inner.sinks.lock().values() {
            sink.emit(event.clone());
        }
    }

    /// Fail the next `connect` with `cause`
    pub fn fail_next_connect(&self, cause: impl Into<String>) {
        self.inner.failures.lock().connect = Some(cause.into());
    }

    /// Fail the next `disconnect` with `cause`
    pub fn fail_next_disconnect(&self, cause: impl Into<String>) {
        self.inner.failures.lock().disconnect = Some(cause.into());
    }

    /// Fail the next `subscribe` with `cause`
    pub fn fail_next_subscribe(&self, cause: impl Into<String>) {
        self.inner.failures.lock().subscribe = Some(cause.into());
    }

    /// Fail the next `publish` with `cause`
    pub fn fail_next_publish(&self, cause: impl Into<String>) {
        self.inner.failures.lock().publish = Some(cause.into());
    }

    /// Delay every `connect` by `delay`
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.inner.connect_delay.lock() = delay;
    }

    /// Hold every `disconnect` for `delay` after the transport has detached
    pub fn set_disconnect_delay(&self, delay: Option<Duration>) {
        *self.inner.disconnect_delay.lock() = delay;
    }

    /// Calls made so far by transports attached to this broker
    pub fn calls(&self) -> CallCounts {
        CallCounts {
            connects: self.inner.connects.load(Ordering::SeqCst),
            disconnects: self.inner.disconnects.load(Ordering::SeqCst),
            subscribes: self.inner.subscribes.load(Ordering::SeqCst),
            publishes: self.inner.publishes.load(Ordering::SeqCst),
        }
    }

    /// Number of transports built through a [`MemoryTransportFactory`]
    pub fn transports_created(&self) -> usize {
        self.inner.transports_created.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// Number of connected transports
    pub fn connection_count(&self) -> usize {
        self.inner.sinks.lock().len()
    }
}

/// Receiving side of one broker subscription; dropping it unsubscribes
struct BrokerStream {
    id: u64,
    broker: Weak<BrokerInner>,
    rx: UnboundedReceiverStream<TransportMessage>,
}

impl Stream for BrokerStream {
    type Item = TransportMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().rx).poll_next(cx)
    }
}

impl Drop for BrokerStream {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.remove_subscription(self.id);
        }
    }
}

/// A transport attached to a [`MemoryBroker`]
pub struct MemoryTransport {
    id: u64,
    broker: MemoryBroker,
    events: TransportEvents,
    connected: AtomicBool,
}

impl MemoryTransport {
    pub fn new(broker: MemoryBroker, events: TransportEvents) -> Self {
        let id = broker.inner.next_id.fetch_add(1, Ordering::SeqCst);
        Self {
            id,
            broker,
            events,
            connected: AtomicBool::new(false),
        }
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let inner = &self.broker.inner;
        inner.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *inner.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(cause) = inner.failures.lock().connect.take() {
            return Err(TransportError::Connect(cause));
        }

        self.connected.store(true, Ordering::SeqCst);
        inner.sinks.lock().insert(self.id, self.events.clone());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let inner = &self.broker.inner;
        inner.disconnects.fetch_add(1, Ordering::SeqCst);

        self.connected.store(false, Ordering::SeqCst);
        inner.sinks.lock().remove(&self.id);
        // Dropping the senders ends every stream this transport handed out
        inner.subscriptions.lock().retain(|s| s.owner != self.id);

        let delay = *inner.disconnect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match inner.failures.lock().disconnect.take() {
            Some(cause) => Err(TransportError::Close(cause)),
            None => Ok(()),
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<InboundStream, TransportError> {
        let inner = &self.broker.inner;
        inner.subscribes.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;

        if let Some(cause) = inner.failures.lock().subscribe.take() {
            return Err(TransportError::Subscribe(cause));
        }

        let pattern =
            SubjectPattern::parse(subject).map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscriptions.lock().push(BrokerSubscription {
            id,
            owner: self.id,
            pattern,
            queue_group: queue_group.map(str::to_string),
            tx,
        });

        Ok(Box::pin(BrokerStream {
            id,
            broker: Arc::downgrade(inner),
            rx: UnboundedReceiverStream::new(rx),
        }))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        let inner = &self.broker.inner;
        inner.publishes.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;

        if let Some(cause) = inner.failures.lock().publish.take() {
            return Err(TransportError::Publish(cause));
        }

        self.broker.publish(subject, payload).map(|_| ())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.broker.inner.sinks.lock().remove(&self.id);
    }
}

/// Builds [`MemoryTransport`]s attached to one broker
#[derive(Clone, Default)]
pub struct MemoryTransportFactory {
    broker: MemoryBroker,
}

impl MemoryTransportFactory {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, _config: &RelayConfig, events: TransportEvents) -> Arc<dyn Transport> {
        self.broker
            .inner
            .transports_created
            .fetch_add(1, Ordering::SeqCst);
        Arc::new(MemoryTransport::new(self.broker.clone(), events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn connected(broker: &MemoryBroker) -> MemoryTransport {
        let transport = MemoryTransport::new(broker.clone(), TransportEvents::detached());
        transport.connect().await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_fan_out_to_plain_subscribers() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker).await;

        let mut a = transport.subscribe("orders.*", None).await.unwrap();
        let mut b = transport.subscribe("orders.created", None).await.unwrap();

        transport
            .publish("orders.created", Bytes::from_static(b"one"))
            .await
            .unwrap();

        assert_eq!(a.next().await.unwrap().payload, Bytes::from_static(b"one"));
        assert_eq!(b.next().await.unwrap().subject, "orders.created");
    }

    #[tokio::test]
    async fn test_queue_group_delivers_to_one_member() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker).await;

        let mut w1 = transport.subscribe("jobs", Some("workers")).await.unwrap();
        let mut w2 = transport.subscribe("jobs", Some("workers")).await.unwrap();

        for i in 0..4 {
            let delivered = broker.publish("jobs", format!("job-{}", i)).unwrap();
            assert_eq!(delivered, 1);
        }

        let mut first = Vec::new();
        let mut second = Vec::new();
        for _ in 0..2 {
            first.push(w1.next().await.unwrap().payload);
            second.push(w2.next().await.unwrap().payload);
        }

        assert_eq!(first, vec![Bytes::from("job-0"), Bytes::from("job-2")]);
        assert_eq!(second, vec![Bytes::from("job-1"), Bytes::from("job-3")]);
    }

    #[tokio::test]
    async fn test_dropping_stream_unsubscribes() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker).await;

        let stream = transport.subscribe("orders.>", None).await.unwrap();
        assert_eq!(broker.subscription_count(), 1);

        drop(stream);
        assert_eq!(broker.subscription_count(), 0);
        assert_eq!(broker.publish("orders.created", "x").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_ends_streams() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker).await;

        let mut stream = transport.subscribe("orders.created", None).await.unwrap();
        transport.disconnect().await.unwrap();

        assert!(stream.next().await.is_none());
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let broker = MemoryBroker::new();
        let transport = MemoryTransport::new(broker.clone(), TransportEvents::detached());

        assert_eq!(
            transport.publish("a", Bytes::new()).await,
            Err(TransportError::NotConnected)
        );
        assert!(transport.subscribe("a", None).await.is_err());
        assert_eq!(broker.calls().publishes, 1);
        assert_eq!(broker.calls().subscribes, 1);
    }

    #[tokio::test]
    async fn test_injected_failures_fire_once() {
        let broker = MemoryBroker::new();
        let transport = MemoryTransport::new(broker.clone(), TransportEvents::detached());

        broker.fail_next_connect("refused");
        assert_eq!(
            transport.connect().await,
            Err(TransportError::Connect("refused".into()))
        );
        assert!(transport.connect().await.is_ok());

        broker.fail_next_publish("full");
        assert!(transport.publish("a", Bytes::new()).await.is_err());
        assert!(transport.publish("a", Bytes::new()).await.is_ok());
        assert_eq!(broker.calls().connects, 2);
    }

    #[tokio::test]
    async fn test_emit_reaches_connected_transports() {
        let broker = MemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = MemoryTransport::new(broker.clone(), TransportEvents::new(3, tx));
        transport.connect().await.unwrap();

        broker.emit(TransportEvent::LameDuck);
        assert_eq!(rx.recv().await, Some((3, TransportEvent::LameDuck)));
    }
}
