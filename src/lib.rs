//! Relay SDK
//!
//! A client runtime that puts NATS pub/sub and the Relay REST control plane
//! (queue administration, message history) behind one facade, the
//! [`RelayManager`].
//!
//! # Example
//!
//! ```no_run
//! use relay_sdk::{EventKind, HistoryQuery, RelayConfig, RelayManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = RelayManager::new();
//!     relay
//!         .configure(RelayConfig::new(
//!             "nats://localhost:4222",
//!             "https://api.relay.example",
//!             "your-api-key",
//!         ))
//!         .await?;
//!
//!     relay.on(&[EventKind::Connected, EventKind::Disconnected], |event| {
//!         println!("connection event: {}", event.kind());
//!     });
//!
//!     relay.connect().await?;
//!
//!     // Subscribe as part of a queue group
//!     let handle = relay
//!         .subscribe("orders.created", Some("billing"), |msg| match msg {
//!             Ok(msg) => println!("{}: {}", msg.subject, msg.data),
//!             Err(e) => eprintln!("bad delivery: {}", e),
//!         })
//!         .await?;
//!
//!     relay
//!         .publish_json("orders.created", &serde_json::json!({"id": 42}))
//!         .await?;
//!
//!     let history = relay
//!         .get_history(HistoryQuery::new("orders.created").limit(10))
//!         .await?;
//!     println!("{} stored messages", history.len());
//!
//!     relay.unsubscribe(handle).await?;
//!     relay.disconnect().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod error;
mod events;
mod manager;
mod subscriptions;

pub mod logging;
pub mod rest;
pub mod subjects;
pub mod transport;

pub use config::{LogLevel, NatsOptions, RelayConfig};
pub use connection::ConnectionStatus;
pub use error::{RelayError, Result};
pub use events::{Event, EventBus, EventHandler, EventKind, ListenerId};
pub use manager::RelayManager;
pub use rest::{HistoryMessage, HistoryQuery, QueueInfo, RestGateway};
pub use subscriptions::{Message, MessageHandler, Subscription, SubscriptionHandle};
