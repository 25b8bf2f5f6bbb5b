//! CLI command definitions

use clap::{Parser, Subcommand};
use relay_sdk::LogLevel;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Relay messaging and control plane client", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// NATS server URL
    #[arg(long, env = "RELAY_NATS_URL", default_value = "nats://localhost:4222", global = true)]
    pub nats_url: String,

    /// Relay REST API base URL
    #[arg(long, env = "RELAY_API_URL", default_value = "http://localhost:8080", global = true)]
    pub api_url: String,

    /// API key sent as a bearer token
    #[arg(long, env = "RELAY_API_KEY", default_value = "", hide_env_values = true, global = true)]
    pub api_key: String,

    /// Client name reported to the NATS server
    #[arg(long, global = true)]
    pub name: Option<String>,

    /// Validate subjects before sending them
    #[arg(long, global = true)]
    pub pedantic: bool,

    /// Log every publish and delivery
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "warn", global = true)]
    pub log_level: LogLevel,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Publish a message
    ///
    /// Examples:
    ///   relay publish orders.created '{"id": 42}'
    Publish {
        /// Subject to publish to
        subject: String,

        /// Message payload
        message: String,
    },

    /// Print messages until interrupted
    ///
    /// Examples:
    ///   relay subscribe 'orders.>'
    ///   relay subscribe orders.created --queue billing
    Subscribe {
        /// Subject or wildcard pattern
        subject: String,

        /// Join a queue group
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Manage queues
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Show stored messages for a subject
    ///
    /// Examples:
    ///   relay history orders.created --limit 20
    ///   relay history orders.created --start 2024-05-01T00:00:00Z
    History {
        /// Subject to look up
        subject: String,

        /// Only messages at or after this time (RFC 3339)
        #[arg(long, value_parser = parse_time)]
        start: Option<chrono::DateTime<chrono::Utc>>,

        /// Only messages at or before this time (RFC 3339)
        #[arg(long, value_parser = parse_time)]
        end: Option<chrono::DateTime<chrono::Utc>>,

        /// Maximum number of messages
        #[arg(short, long, default_value_t = relay_sdk::rest::DEFAULT_HISTORY_LIMIT)]
        limit: u32,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Create a queue
    Create {
        /// Queue name
        name: String,
    },

    /// Show queue details
    Info {
        /// Queue name
        name: String,
    },
}

fn parse_time(s: &str) -> Result<chrono::DateTime<chrono::Utc>, String> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| format!("Invalid time '{}': {}. Expected RFC 3339, e.g. 2024-05-01T10:00:00Z", s, e))
}
