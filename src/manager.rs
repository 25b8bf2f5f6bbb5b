//! Relay manager: the facade over messaging, events and the REST API
//!
//! Mutating operations are sent as commands to one control task and run in
//! submission order. Transport I/O is spawned off the control task and reports
//! back through a completion channel, so a slow connect never blocks an
//! unsubscribe. While a close is in flight, new commands wait until it has
//! finished.
//!
//! REST calls do not go through the control task; they only need the gateway
//! built by `configure`.

use crate::config::RelayConfig;
use crate::connection::{
    ConnectOutcome, ConnectionController, ConnectionStatus, NotificationOutcome,
};
use crate::error::{RelayError, Result};
use crate::events::{Event, EventBus, EventKind, ListenerId};
use crate::rest::{HistoryMessage, HistoryQuery, QueueInfo, RestGateway};
use crate::subjects::{validate_queue_group, Subject, SubjectPattern};
use crate::subscriptions::{
    Message, MessageHandler, Subscription, SubscriptionHandle, SubscriptionRegistry,
};
use crate::transport::{
    InboundStream, NatsTransportFactory, Transport, TransportError, TransportEvent,
    TransportEvents, TransportFactory,
};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Longest a transport close may take before the session is given up
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests from the public API
enum Command {
    Configure {
        config: RelayConfig,
        reply: Reply<()>,
    },
    Connect {
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Subscribe {
        subject: String,
        queue_group: Option<String>,
        handler: MessageHandler,
        reply: Reply<SubscriptionHandle>,
    },
    Unsubscribe {
        handle: SubscriptionHandle,
        reply: Reply<()>,
    },
    Publish {
        subject: String,
        payload: Bytes,
        reply: Reply<()>,
    },
    Subscriptions {
        reply: Reply<Vec<Subscription>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Results of transport I/O spawned by the control task
enum Completion {
    Connect {
        generation: u64,
        transport: Arc<dyn Transport>,
        result: std::result::Result<(), TransportError>,
        reply: Reply<()>,
    },
    Disconnect {
        result: std::result::Result<(), TransportError>,
        reply: Option<Reply<()>>,
    },
    Subscribe {
        generation: u64,
        subject: String,
        queue_group: Option<String>,
        handler: MessageHandler,
        result: std::result::Result<InboundStream, TransportError>,
        reply: Reply<SubscriptionHandle>,
    },
}

/// A publish waiting for the session's publisher task
struct OutboundMessage {
    subject: String,
    payload: Bytes,
    reply: Reply<()>,
}

/// Per-session ordered publisher
///
/// Dropping it ends the session's publish queue: messages still queued are
/// answered with `NotConnected` instead of reaching the transport.
struct Publisher {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    closed: Arc<AtomicBool>,
}

impl Publisher {
    fn start(transport: Arc<dyn Transport>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let closed = Arc::new(AtomicBool::new(false));
        let session_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if session_closed.load(Ordering::SeqCst) {
                    let _ = msg.reply.send(Err(RelayError::NotConnected));
                    continue;
                }
                let result = transport
                    .publish(&msg.subject, msg.payload)
                    .await
                    .map_err(|e| RelayError::PublishFailed(e.to_string()));
                if let Err(e) = &result {
                    warn!(subject = %msg.subject, error = %e, "Publish failed");
                }
                let _ = msg.reply.send(result);
            }
        });
        Self { tx, closed }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// State readable outside the control task
struct Shared {
    config: RwLock<Option<Arc<RelayConfig>>>,
    gateway: RwLock<Option<Arc<RestGateway>>>,
}

struct ManagerInner {
    commands: mpsc::UnboundedSender<Command>,
    events: Arc<EventBus>,
    status_rx: watch::Receiver<ConnectionStatus>,
    shared: Arc<Shared>,
    shut_down: AtomicBool,
}

/// Entry point of the Relay SDK
///
/// Cheaply cloneable; clones drive the same session. Construction spawns the
/// control task, so it must happen inside a Tokio runtime.
#[derive(Clone)]
pub struct RelayManager {
    inner: Arc<ManagerInner>,
}

impl RelayManager {
    /// Create a manager that talks NATS through `async-nats`
    pub fn new() -> Self {
        Self::with_transport_factory(Arc::new(NatsTransportFactory))
    }

    /// Create a manager with a custom transport
    pub fn with_transport_factory(factory: Arc<dyn TransportFactory>) -> Self {
        let events = Arc::new(EventBus::new());
        let (controller, status_rx) = ConnectionController::new(events.clone());
        let shared = Arc::new(Shared {
            config: RwLock::new(None),
            gateway: RwLock::new(None),
        });

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let task = ControlTask {
            controller,
            registry: SubscriptionRegistry::new(),
            factory,
            shared: shared.clone(),
            config: None,
            epoch: 0,
            publisher: None,
            completions: completions_tx,
            transport_events: transport_tx,
        };
        tokio::spawn(task.run(commands_rx, completions_rx, transport_rx));

        Self {
            inner: Arc::new(ManagerInner {
                commands: commands_tx,
                events,
                status_rx,
                shared,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(RelayError::Shutdown);
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(command(tx))
            .map_err(|_| RelayError::Shutdown)?;
        rx.await.map_err(|_| RelayError::Shutdown)?
    }

    fn gateway(&self) -> Result<Arc<RestGateway>> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(RelayError::Shutdown);
        }
        self.inner
            .shared
            .gateway
            .read()
            .clone()
            .ok_or(RelayError::NotConfigured)
    }

    /// Apply a configuration
    ///
    /// Replacing an existing configuration closes the current session first.
    pub async fn configure(&self, config: RelayConfig) -> Result<()> {
        self.call(|reply| Command::Configure { config, reply }).await
    }

    /// Establish a messaging session
    ///
    /// Fires `Connected` on success; on failure fires `Error` and returns
    /// [`RelayError::ConnectionFailed`].
    pub async fn connect(&self) -> Result<()> {
        self.call(|reply| Command::Connect { reply }).await
    }

    /// Close the messaging session; a no-op when already disconnected
    pub async fn disconnect(&self) -> Result<()> {
        self.call(|reply| Command::Disconnect { reply }).await
    }

    /// Subscribe to `subject`, optionally as a member of `queue_group`
    ///
    /// The handler runs on the blocking pool, one delivery at a time. A payload
    /// that is not UTF-8 reaches it as [`RelayError::InvalidMessageFormat`].
    pub async fn subscribe<F>(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        handler: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(Result<Message>) + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(handler);
        self.call(|reply| Command::Subscribe {
            subject: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            handler,
            reply,
        })
        .await
    }

    /// Stop a subscription; unknown or inactive handles are ignored
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        self.call(|reply| Command::Unsubscribe { handle, reply }).await
    }

    /// Publish a raw payload
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        self.call(|reply| Command::Publish {
            subject: subject.to_string(),
            payload,
            reply,
        })
        .await
    }

    /// Publish `value` encoded as JSON
    pub async fn publish_json<T: Serialize + ?Sized>(&self, subject: &str, value: &T) -> Result<()> {
        let payload =
            serde_json::to_vec(value).map_err(|e| RelayError::PublishFailed(e.to_string()))?;
        self.publish(subject, payload).await
    }

    /// Create a queue through the REST API
    pub async fn create_queue(&self, name: &str) -> Result<QueueInfo> {
        self.gateway()?.create_queue(name).await
    }

    /// Fetch queue details through the REST API
    pub async fn get_queue_info(&self, name: &str) -> Result<QueueInfo> {
        self.gateway()?.get_queue_info(name).await
    }

    /// Fetch stored messages for a subject
    pub async fn get_history(&self, query: HistoryQuery) -> Result<Vec<HistoryMessage>> {
        self.gateway()?.get_history(&query).await
    }

    /// Listen for every event in `events`
    pub fn on<F>(&self, events: &[EventKind], handler: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.on(events, handler)
    }

    /// Listen for the first matching event only
    pub fn once<F>(&self, events: &[EventKind], handler: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.once(events, handler)
    }

    /// Remove a listener from every event kind
    pub fn off(&self, id: ListenerId) {
        self.inner.events.off(id)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status_rx.borrow().clone()
    }

    /// Receiver notified on every status transition
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_rx.clone()
    }

    /// The active configuration, if any
    pub fn configuration(&self) -> Option<Arc<RelayConfig>> {
        self.inner.shared.config.read().clone()
    }

    /// Snapshot of the active subscriptions
    pub async fn subscriptions(&self) -> Result<Vec<Subscription>> {
        self.call(|reply| Command::Subscriptions { reply }).await
    }

    /// Close the session and stop the control task
    ///
    /// Every later operation fails with [`RelayError::Shutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.call(|reply| Command::Shutdown { reply }).await;
        self.inner.shut_down.store(true, Ordering::SeqCst);
        match result {
            Err(RelayError::Shutdown) => Ok(()),
            other => other,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl Default for RelayManager {
    fn default() -> Self {
        Self::new()
    }
}

fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Close `transport`, giving up after [`CLOSE_TIMEOUT`]
///
/// Dropping the pending close releases the transport's session.
async fn close_transport(
    transport: &Arc<dyn Transport>,
) -> std::result::Result<(), TransportError> {
    match tokio::time::timeout(CLOSE_TIMEOUT, transport.disconnect()).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Close(format!(
            "timed out after {}s",
            CLOSE_TIMEOUT.as_secs()
        ))),
    }
}

/// State owned by the control task
struct ControlTask {
    controller: ConnectionController,
    registry: SubscriptionRegistry,
    factory: Arc<dyn TransportFactory>,
    shared: Arc<Shared>,
    config: Option<Arc<RelayConfig>>,
    /// Bumped for every configuration; stamps transport notifications
    epoch: u64,
    publisher: Option<Publisher>,
    completions: mpsc::UnboundedSender<Completion>,
    transport_events: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl ControlTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut transport_events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    ) {
        debug!("Control task started");

        loop {
            tokio::select! {
                biased;

                Some(completion) = completions.recv() => self.complete(completion),

                Some((epoch, event)) = transport_events.recv() => {
                    self.on_transport_event(epoch, event)
                }

                command = commands.recv(), if !self.controller.is_closing() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.stop().await;
                        break;
                    }
                },
            }
        }

        debug!("Control task stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Configure { config, reply } => {
                let _ = reply.send(self.configure(config));
            }
            Command::Connect { reply } => self.connect(reply),
            Command::Disconnect { reply } => self.disconnect(Some(reply)),
            Command::Subscribe {
                subject,
                queue_group,
                handler,
                reply,
            } => self.subscribe(subject, queue_group, handler, reply),
            Command::Unsubscribe { handle, reply } => {
                self.registry.unsubscribe(handle);
                let _ = reply.send(Ok(()));
            }
            Command::Publish {
                subject,
                payload,
                reply,
            } => self.publish(subject, payload, reply),
            Command::Subscriptions { reply } => {
                let _ = reply.send(Ok(self.registry.active()));
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(Err(RelayError::Shutdown));
            }
        }
    }

    fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::Connect {
                generation,
                transport,
                result,
                reply,
            } => {
                let succeeded = result.is_ok();
                let outcome = self.controller.finish_connect(generation, result);
                let _ = match outcome {
                    ConnectOutcome::Connected => {
                        self.publisher = Some(Publisher::start(transport));
                        reply.send(Ok(()))
                    }
                    ConnectOutcome::Failed(cause) => {
                        reply.send(Err(RelayError::ConnectionFailed(cause)))
                    }
                    ConnectOutcome::Stale => {
                        if succeeded && !self.owns_live_attempt(&transport) {
                            debug!("Closing superseded session");
                            tokio::spawn(async move {
                                if let Err(e) = close_transport(&transport).await {
                                    debug!(error = %e, "Closing superseded session failed");
                                }
                            });
                        }
                        reply.send(Err(RelayError::ConnectionFailed(
                            "connection attempt superseded".into(),
                        )))
                    }
                };
            }
            Completion::Disconnect { result, reply } => {
                self.controller.finish_disconnect(result);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Completion::Subscribe {
                generation,
                subject,
                queue_group,
                handler,
                result,
                reply,
            } => {
                if generation != self.controller.generation()
                    || !self.controller.status().is_connected()
                {
                    let _ = reply.send(Err(RelayError::NotConnected));
                    return;
                }

                let _ = match result {
                    Ok(stream) => {
                        let handle = self.registry.insert(
                            subject,
                            queue_group,
                            stream,
                            handler,
                            self.verbose(),
                        );
                        reply.send(Ok(handle))
                    }
                    Err(e) => {
                        warn!(subject = %subject, error = %e, "Subscribe failed");
                        reply.send(Err(RelayError::SubscriptionFailed(e.to_string())))
                    }
                };
            }
        }
    }

    /// A newer attempt on `transport` is connecting or connected
    ///
    /// Never true while a close is in flight: that close retired every attempt
    /// on the current transport.
    fn owns_live_attempt(&self, transport: &Arc<dyn Transport>) -> bool {
        if self.controller.is_closing() {
            return false;
        }
        let busy = matches!(
            self.controller.status(),
            ConnectionStatus::Connecting | ConnectionStatus::Connected
        );
        busy && self
            .controller
            .transport()
            .is_some_and(|current| same_transport(&current, transport))
    }

    fn verbose(&self) -> bool {
        self.config.as_ref().is_some_and(|c| c.nats.verbose)
    }

    fn pedantic(&self) -> bool {
        self.config.as_ref().is_some_and(|c| c.nats.pedantic)
    }

    fn configure(&mut self, config: RelayConfig) -> Result<()> {
        config.validate()?;
        let gateway = Arc::new(RestGateway::new(&config)?);
        let config = Arc::new(config);

        if self.config.is_some() {
            info!("Replacing configuration");
            self.disconnect(None);
        }

        self.epoch += 1;
        let events = TransportEvents::new(self.epoch, self.transport_events.clone());
        let transport = self.factory.create(&config, events);
        self.controller.attach(transport);

        *self.shared.config.write() = Some(config.clone());
        *self.shared.gateway.write() = Some(gateway);
        info!(nats_url = %config.nats_url, api = %config.api_base_url, "Configured");
        self.config = Some(config);
        Ok(())
    }

    fn connect(&mut self, reply: Reply<()>) {
        if self.config.is_none() {
            let _ = reply.send(Err(RelayError::NotConfigured));
            return;
        }

        let ticket = match self.controller.begin_connect() {
            Ok(ticket) => ticket,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = ticket.transport.connect().await;
            let _ = completions.send(Completion::Connect {
                generation: ticket.generation,
                transport: ticket.transport,
                result,
                reply,
            });
        });
    }

    fn disconnect(&mut self, reply: Option<Reply<()>>) {
        let ticket = match self.controller.begin_disconnect() {
            Some(ticket) => ticket,
            None => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                return;
            }
        };

        self.teardown();

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = close_transport(&ticket.transport).await;
            let _ = completions.send(Completion::Disconnect { result, reply });
        });
    }

    /// Drop everything bound to the current session
    fn teardown(&mut self) {
        if !self.registry.is_empty() {
            debug!(count = self.registry.len(), "Tearing down subscriptions");
        }
        self.registry.clear();
        self.publisher = None;
    }

    fn subscribe(
        &mut self,
        subject: String,
        queue_group: Option<String>,
        handler: MessageHandler,
        reply: Reply<SubscriptionHandle>,
    ) {
        if self.config.is_none() {
            let _ = reply.send(Err(RelayError::NotConfigured));
            return;
        }
        if !self.controller.status().is_connected() {
            let _ = reply.send(Err(RelayError::NotConnected));
            return;
        }
        if self.pedantic() {
            let checked = SubjectPattern::parse(&subject).and_then(|_| match &queue_group {
                Some(group) => validate_queue_group(group),
                None => Ok(()),
            });
            if let Err(e) = checked {
                let _ = reply.send(Err(RelayError::SubscriptionFailed(e.to_string())));
                return;
            }
        }

        let Some(transport) = self.controller.transport() else {
            let _ = reply.send(Err(RelayError::NotConfigured));
            return;
        };

        let generation = self.controller.generation();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = transport.subscribe(&subject, queue_group.as_deref()).await;
            let _ = completions.send(Completion::Subscribe {
                generation,
                subject,
                queue_group,
                handler,
                result,
                reply,
            });
        });
    }

    fn publish(&mut self, subject: String, payload: Bytes, reply: Reply<()>) {
        if self.config.is_none() {
            let _ = reply.send(Err(RelayError::NotConfigured));
            return;
        }
        let Some(publisher) = self.publisher.as_ref() else {
            let _ = reply.send(Err(RelayError::NotConnected));
            return;
        };
        if self.pedantic() {
            if let Err(e) = Subject::parse(&subject) {
                let _ = reply.send(Err(RelayError::PublishFailed(e.to_string())));
                return;
            }
        }

        if self.verbose() {
            debug!(subject = %subject, bytes = payload.len(), "Publishing");
        }

        if let Err(mpsc::error::SendError(msg)) = publisher.tx.send(OutboundMessage {
            subject,
            payload,
            reply,
        }) {
            let _ = msg.reply.send(Err(RelayError::NotConnected));
        }
    }

    fn on_transport_event(&mut self, epoch: u64, event: TransportEvent) {
        if epoch != self.epoch {
            debug!(
                epoch,
                current = self.epoch,
                ?event,
                "Ignoring notification from replaced transport"
            );
            return;
        }

        if self.controller.on_transport_event(event) == NotificationOutcome::Closed {
            self.teardown();
            self.controller.session_closed();
        }
    }

    /// Close the session inline before the control task exits
    async fn stop(&mut self) {
        self.teardown();
        if let Some(ticket) = self.controller.begin_disconnect() {
            let result = close_transport(&ticket.transport).await;
            self.controller.finish_disconnect(result);
        }
        *self.shared.gateway.write() = None;
        info!("Relay manager shut down");
    }
}
