use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

use crate::core::admission::{Override, Rule};
use crate::core::channel::ChannelSettings;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub admission_poll_interval_ms: u64,
    pub admission_max_backoff_ms: u64,
    pub min_heartbeat_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            admission_poll_interval_ms: 5_000,
            admission_max_backoff_ms: 60_000,
            min_heartbeat_timeout_ms: 1_000,
        }
    }
}

impl BrokerConfig {
    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            admission_poll_interval: Duration::from_millis(self.admission_poll_interval_ms),
            admission_max_backoff: Duration::from_millis(self.admission_max_backoff_ms),
        }
    }

    pub fn min_heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.min_heartbeat_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Rules and overrides loaded into the in-process admission service.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AdmissionConfig {
    pub rules: Vec<Rule>,
    pub overrides: Vec<Override>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub logging: LoggingConfig,
    pub admission: AdmissionConfig,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(path)?;
    parse_config(&raw)
}

pub fn parse_config(raw: &str) -> Result<Config, anyhow::Error> {
    let config: Config = toml::from_str(raw)?;
    if config.broker.admission_poll_interval_ms == 0 {
        anyhow::bail!("broker.admission_poll_interval_ms must be greater than zero");
    }
    Ok(config)
}
