//! Configuration for the Relay runtime

use crate::error::{RelayError, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Minimum level for the runtime's own log output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    #[default]
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_directive())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!(
                "Invalid log level: {}. Must be trace, debug, info, warn, or error",
                s
            )),
        }
    }
}

/// Messaging client options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsOptions {
    /// Log every publish and delivery at debug level
    pub verbose: bool,

    /// Validate subjects and queue groups before they reach the transport
    pub pedantic: bool,

    /// Client name announced to the messaging server
    pub name: String,

    /// Minimum log level
    pub log_level: LogLevel,
}

impl Default for NatsOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            pedantic: false,
            name: format!("relay-sdk {}", env!("CARGO_PKG_VERSION")),
            log_level: LogLevel::Error,
        }
    }
}

impl NatsOptions {
    /// Enable or disable verbose publish/delivery logging
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Enable or disable strict subject validation
    pub fn pedantic(mut self, pedantic: bool) -> Self {
        self.pedantic = pedantic;
        self
    }

    /// Set the client name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the minimum log level
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }
}

/// Configuration applied to a [`RelayManager`](crate::RelayManager)
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Messaging server URL (e.g., "nats://localhost:4222")
    pub nats_url: String,

    /// REST API base URL (e.g., "https://api.example.com/v1")
    pub api_base_url: String,

    /// API key sent as a bearer token on every REST request
    pub api_key: String,

    /// Messaging client options
    pub nats: NatsOptions,

    /// Per-request REST timeout (idle time waiting on the server)
    pub request_timeout: Duration,

    /// Total REST timeout covering the whole transfer
    pub resource_timeout: Duration,
}

impl RelayConfig {
    /// Create a new configuration with default messaging options and timeouts
    pub fn new(
        nats_url: impl Into<String>,
        api_base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            nats_url: nats_url.into(),
            api_base_url: api_base_url.into(),
            api_key: api_key.into(),
            nats: NatsOptions::default(),
            request_timeout: Duration::from_secs(30),
            resource_timeout: Duration::from_secs(300),
        }
    }

    /// Replace the messaging client options
    pub fn nats_options(mut self, options: NatsOptions) -> Self {
        self.nats = options;
        self
    }

    /// Set the per-request REST timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the total REST timeout
    pub fn resource_timeout(mut self, timeout: Duration) -> Self {
        self.resource_timeout = timeout;
        self
    }

    /// Parsed REST base URL
    pub fn api_base(&self) -> Result<Url> {
        let url = Url::parse(&self.api_base_url).map_err(|e| {
            RelayError::InvalidConfiguration(format!(
                "invalid API base URL '{}': {}",
                self.api_base_url, e
            ))
        })?;

        if url.cannot_be_a_base() {
            return Err(RelayError::InvalidConfiguration(format!(
                "API base URL '{}' cannot be used as a base",
                self.api_base_url
            )));
        }

        Ok(url)
    }

    /// Check the configuration before it is applied
    pub fn validate(&self) -> Result<()> {
        if self.nats_url.trim().is_empty() {
            return Err(RelayError::InvalidConfiguration(
                "messaging URL cannot be empty".into(),
            ));
        }

        if self.request_timeout > self.resource_timeout {
            return Err(RelayError::InvalidConfiguration(
                "request timeout must not exceed resource timeout".into(),
            ));
        }

        self.api_base().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_new_defaults() {
        let config = RelayConfig::new("nats://localhost:4222", "https://api.test", "key");

        assert_eq!(config.nats_url, "nats://localhost:4222");
        assert_eq!(config.api_base_url, "https://api.test");
        assert_eq!(config.api_key, "key");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.resource_timeout, Duration::from_secs(300));
        assert!(!config.nats.verbose);
        assert!(!config.nats.pedantic);
        assert_eq!(config.nats.log_level, LogLevel::Error);
        assert!(config.nats.name.starts_with("relay-sdk "));
    }

    #[test]
    fn test_config_builder_chain() {
        let config = RelayConfig::new("nats://test:4222", "https://api.test", "k")
            .nats_options(
                NatsOptions::default()
                    .verbose(true)
                    .pedantic(true)
                    .name("orders-service")
                    .log_level(LogLevel::Debug),
            )
            .request_timeout(Duration::from_secs(5))
            .resource_timeout(Duration::from_secs(60));

        assert!(config.nats.verbose);
        assert!(config.nats.pedantic);
        assert_eq!(config.nats.name, "orders-service");
        assert_eq!(config.nats.log_level, LogLevel::Debug);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.resource_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let config = RelayConfig::new("nats://test:4222", "https://api.test", "k");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_api_url() {
        let config = RelayConfig::new("nats://test:4222", "not a url", "k");
        assert!(matches!(
            config.validate(),
            Err(RelayError::InvalidConfiguration(_))
        ));

        let config = RelayConfig::new("nats://test:4222", "mailto:ops@example.com", "k");
        assert!(matches!(
            config.validate(),
            Err(RelayError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_nats_url() {
        let config = RelayConfig::new("  ", "https://api.test", "k");
        assert!(matches!(
            config.validate(),
            Err(RelayError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_timeouts() {
        let config = RelayConfig::new("nats://test:4222", "https://api.test", "k")
            .request_timeout(Duration::from_secs(600));
        assert!(matches!(
            config.validate(),
            Err(RelayError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Info.to_string(), "info");
    }

    #[test]
    fn test_config_clone() {
        let config1 = RelayConfig::new("nats://test:4222", "https://api.test", "k");
        let config2 = config1.clone();

        assert_eq!(config1.nats_url, config2.nats_url);
        assert_eq!(config1.api_key, config2.api_key);
        assert_eq!(config1.nats, config2.nats);
    }
}
