//! NATS transport backed by `async-nats`

use super::{
    InboundStream, Transport, TransportError, TransportEvent, TransportEvents, TransportFactory,
    TransportMessage,
};
use crate::config::RelayConfig;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Transport speaking the NATS protocol through an `async_nats::Client`
pub struct NatsTransport {
    url: String,
    name: String,
    events: TransportEvents,
    client: Mutex<Option<async_nats::Client>>,
}

impl NatsTransport {
    pub fn new(config: &RelayConfig, events: TransportEvents) -> Self {
        Self {
            url: config.nats_url.clone(),
            name: config.nats.name.clone(),
            events,
            client: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<async_nats::Client, TransportError> {
        self.client
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)
    }
}

/// Translate async-nats lifecycle events
fn map_event(event: async_nats::Event) -> Option<TransportEvent> {
    use async_nats::Event;

    match event {
        Event::Connected => Some(TransportEvent::Connected),
        Event::Disconnected => Some(TransportEvent::Disconnected),
        Event::LameDuckMode => Some(TransportEvent::LameDuck),
        Event::SlowConsumer(sid) => Some(TransportEvent::SlowConsumer(sid)),
        Event::ServerError(e) => Some(TransportEvent::Error(e.to_string())),
        Event::ClientError(e) => Some(TransportEvent::Error(e.to_string())),
        Event::Closed => Some(TransportEvent::Closed),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let events = self.events.clone();
        // The first `Connected` belongs to this connect call, whose completion
        // already reports it
        let initial = Arc::new(AtomicBool::new(true));
        let options = async_nats::ConnectOptions::new()
            .name(self.name.clone())
            .event_callback(move |event| {
                let events = events.clone();
                let initial = initial.clone();
                async move {
                    if matches!(event, async_nats::Event::Connected)
                        && initial.swap(false, Ordering::SeqCst)
                    {
                        return;
                    }
                    if let Some(event) = map_event(event) {
                        events.emit(event);
                    }
                }
            });

        debug!(url = %self.url, name = %self.name, "Connecting to NATS");
        let client = options
            .connect(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        *self.client.lock() = Some(client);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let client = self.client.lock().take();
        match client {
            // Dropping the last client handle closes the socket
            Some(client) => client
                .flush()
                .await
                .map_err(|e| TransportError::Close(e.to_string())),
            None => Ok(()),
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<InboundStream, TransportError> {
        let client = self.client()?;

        let subscriber = match queue_group {
            Some(group) => client
                .queue_subscribe(subject.to_string(), group.to_string())
                .await,
            None => client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let stream = subscriber.map(|msg| TransportMessage {
            subject: msg.subject.to_string(),
            reply: msg.reply.map(|r| r.to_string()),
            payload: msg.payload,
        });

        Ok(Box::pin(stream))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.client()?
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}

/// Builds a [`NatsTransport`] per configuration
#[derive(Debug, Default, Clone, Copy)]
pub struct NatsTransportFactory;

impl TransportFactory for NatsTransportFactory {
    fn create(&self, config: &RelayConfig, events: TransportEvents) -> Arc<dyn Transport> {
        Arc::new(NatsTransport::new(config, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_lifecycle_events() {
        assert_eq!(
            map_event(async_nats::Event::Connected),
            Some(TransportEvent::Connected)
        );
        assert_eq!(
            map_event(async_nats::Event::Disconnected),
            Some(TransportEvent::Disconnected)
        );
        assert_eq!(
            map_event(async_nats::Event::LameDuckMode),
            Some(TransportEvent::LameDuck)
        );
        assert_eq!(
            map_event(async_nats::Event::SlowConsumer(7)),
            Some(TransportEvent::SlowConsumer(7))
        );
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let config = RelayConfig::new("nats://127.0.0.1:4222", "https://api.test", "k");
        let transport = NatsTransport::new(&config, TransportEvents::detached());

        assert_eq!(
            transport.publish("orders.created", Bytes::from_static(b"{}")).await,
            Err(TransportError::NotConnected)
        );
        assert!(matches!(
            transport.subscribe("orders.created", None).await,
            Err(TransportError::NotConnected)
        ));
        assert!(transport.disconnect().await.is_ok());
    }
}
