//! Connection state machine
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!      ▲                        │                  │
//!      │                        └──err──▶ Error ◀──┘ (transport error, status unchanged)
//!      └──────────── disconnect / transport closed ─┘
//! ```
//!
//! The controller is owned by the manager's control task and never shared, so
//! its methods take `&mut self` and run synchronously. Transport I/O itself is
//! spawned by the caller; completions come back tagged with the session
//! generation they were started for.

use crate::error::{RelayError, Result};
use crate::events::{Event, EventBus};
use crate::transport::{Transport, TransportError, TransportEvent};

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Connection status of a manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No session
    Disconnected,
    /// Waiting for the transport to establish a session
    Connecting,
    /// Session established
    Connected,
    /// The last connect attempt failed
    Error(String),
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Error(cause) => write!(f, "error: {}", cause),
        }
    }
}

/// A connect or close started by the controller
pub(crate) struct SessionTicket {
    pub generation: u64,
    pub transport: Arc<dyn Transport>,
}

/// What became of a connect completion
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConnectOutcome {
    /// The session is established
    Connected,
    /// The attempt failed; status and bus already reflect it
    Failed(String),
    /// The attempt was superseded by a disconnect or a newer configuration
    Stale,
}

/// What a transport notification means for the session
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum NotificationOutcome {
    Ignored,
    Broadcast,
    /// The transport is gone; the caller must tear the session down and then
    /// call [`ConnectionController::session_closed`]
    Closed,
}

pub(crate) struct ConnectionController {
    status: watch::Sender<ConnectionStatus>,
    events: Arc<EventBus>,
    transport: Option<Arc<dyn Transport>>,
    generation: u64,
    closing: bool,
}

impl ConnectionController {
    pub fn new(events: Arc<EventBus>) -> (Self, watch::Receiver<ConnectionStatus>) {
        let (status, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let controller = Self {
            status,
            events,
            transport: None,
            generation: 0,
            closing: false,
        };
        (controller, status_rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A close started by `begin_disconnect` has not completed yet
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.clone()
    }

    /// Install the transport for a new configuration
    ///
    /// Returns the previous transport. Any attempt in flight becomes stale.
    pub fn attach(&mut self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        self.generation += 1;
        self.transport.replace(transport)
    }

    fn set_status(&self, status: ConnectionStatus) {
        debug!(status = %status, "Connection status changed");
        self.status.send_replace(status);
    }

    /// Move to `Connecting` and hand out the transport to connect with
    pub fn begin_connect(&mut self) -> Result<SessionTicket> {
        let transport = self.transport.clone().ok_or(RelayError::NotConfigured)?;

        let status = self.status();
        if matches!(status, ConnectionStatus::Connecting | ConnectionStatus::Connected) {
            return Err(RelayError::ConnectionFailed(format!(
                "cannot connect in state {}",
                status
            )));
        }

        self.generation += 1;
        self.set_status(ConnectionStatus::Connecting);
        info!(generation = self.generation, "Connecting");

        Ok(SessionTicket {
            generation: self.generation,
            transport,
        })
    }

    /// Apply the result of a connect started with `begin_connect`
    pub fn finish_connect(
        &mut self,
        generation: u64,
        result: std::result::Result<(), TransportError>,
    ) -> ConnectOutcome {
        if generation != self.generation || self.status() != ConnectionStatus::Connecting {
            debug!(generation, current = self.generation, "Discarding stale connect completion");
            return ConnectOutcome::Stale;
        }

        match result {
            Ok(()) => {
                self.set_status(ConnectionStatus::Connected);
                info!("Connected");
                self.events.fire(&Event::Connected);
                ConnectOutcome::Connected
            }
            Err(e) => {
                let cause = e.to_string();
                error!(error = %cause, "Connect failed");
                self.set_status(ConnectionStatus::Error(cause.clone()));
                self.events.fire(&Event::Error(cause.clone()));
                ConnectOutcome::Failed(cause)
            }
        }
    }

    /// Start closing the session
    ///
    /// Returns `None` when already disconnected. Otherwise the session
    /// generation is retired, so a connect still in flight becomes stale.
    pub fn begin_disconnect(&mut self) -> Option<SessionTicket> {
        if self.status() == ConnectionStatus::Disconnected {
            return None;
        }

        self.generation += 1;
        let transport = self.transport.clone()?;
        self.closing = true;
        info!(generation = self.generation, "Disconnecting");

        Some(SessionTicket {
            generation: self.generation,
            transport,
        })
    }

    /// Apply the result of a close started with `begin_disconnect`
    pub fn finish_disconnect(&mut self, result: std::result::Result<(), TransportError>) {
        self.closing = false;
        self.set_status(ConnectionStatus::Disconnected);
        info!("Disconnected");
        self.events.fire(&Event::Disconnected);

        if let Err(e) = result {
            warn!(error = %e, "Transport close failed");
            self.events.fire(&Event::Error(e.to_string()));
        }
    }

    /// Interpret a lifecycle notification from the transport
    pub fn on_transport_event(&mut self, event: TransportEvent) -> NotificationOutcome {
        if self.closing || !self.status().is_connected() {
            debug!(?event, "Ignoring transport notification outside a session");
            return NotificationOutcome::Ignored;
        }

        let event = match event {
            TransportEvent::Disconnected => {
                warn!("Transport lost its connection, reconnecting");
                Event::Reconnecting
            }
            TransportEvent::Connected => {
                info!("Transport reconnected");
                Event::Connected
            }
            TransportEvent::Error(cause) => {
                warn!(error = %cause, "Transport error");
                Event::Error(cause)
            }
            TransportEvent::SlowConsumer(sid) => {
                warn!(sid, "Slow consumer");
                Event::SlowConsumer(sid)
            }
            TransportEvent::LameDuck => {
                warn!("Server entered lame duck mode");
                Event::LameDuck
            }
            TransportEvent::Closed => {
                warn!("Transport closed");
                self.generation += 1;
                return NotificationOutcome::Closed;
            }
        };

        self.events.fire(&event);
        NotificationOutcome::Broadcast
    }

    /// Finish a teardown caused by the transport closing
    pub fn session_closed(&mut self) {
        self.set_status(ConnectionStatus::Disconnected);
        info!("Disconnected");
        self.events.fire(&Event::Disconnected);
    }
}
