//! Process configuration: an optional TOML file, overridden by CLI flags.

use crate::application::relay::RelaySettings;
use crate::error::{PaymentError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub broker: Option<BrokerConfig>,
    pub service: ServiceConfig,
    pub relay: RelayConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            database_url: None,
            max_connections: 10,
            broker: None,
            service: ServiceConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// AMQP connection URL (e.g. "amqp://localhost:5672/%2f")
    pub url: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
}

fn default_exchange() -> String {
    "payments".to_string()
}

fn default_routing_key() -> String {
    crate::domain::event::PAYMENT_INITIATED_ROUTING_KEY.to_string()
}

impl BrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: default_exchange(),
            routing_key: default_routing_key(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub request_timeout_ms: u64,
    /// Upper bound on requests processed at once by the batch CLI. With 1,
    /// requests run in file order.
    pub concurrency: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            concurrency: 1,
        }
    }
}

impl ServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub publish_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let settings = RelaySettings::default();
        Self {
            poll_interval_ms: settings.poll_interval.as_millis() as u64,
            batch_size: settings.batch_size,
            publish_timeout_ms: settings.publish_timeout.as_millis() as u64,
        }
    }
}

impl RelayConfig {
    pub fn settings(&self) -> RelaySettings {
        RelaySettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            batch_size: self.batch_size,
            publish_timeout: Duration::from_millis(self.publish_timeout_ms),
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(raw).map_err(|e| PaymentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay.batch_size == 0 {
            return Err(PaymentError::Config(
                "relay.batch_size must be greater than zero".to_string(),
            ));
        }
        if self.service.concurrency == 0 {
            return Err(PaymentError::Config(
                "service.concurrency must be greater than zero".to_string(),
            ));
        }
        if self.relay.publish_timeout_ms >= self.service.request_timeout_ms {
            return Err(PaymentError::Config(
                "relay.publish_timeout_ms must be shorter than service.request_timeout_ms"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
