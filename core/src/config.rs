use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const DEFAULT_PREFETCH_COUNT: usize = 500;
pub const MINIMUM_PREFETCH_COUNT: usize = 10;
pub const MAXIMUM_PREFETCH_COUNT: usize = 999;
pub const DEFAULT_MAX_EVENT_COUNT: usize = 100;
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 60_000;
pub const MAXIMUM_MESSAGES_PER_SECOND: u32 = 1_000_000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PumpConfig {
    pub version: u32,
    pub source: SourceSettings,
    #[serde(default)]
    pub pump: PumpSettings,
    #[serde(default)]
    pub load: LoadSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceSettings {
    /// Name of the partitioned entity, e.g. an event hub
    pub name: String,
    pub partitions: Vec<String>,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PumpSettings {
    /// Upper bound on messages requested per receive
    pub prefetch_count: usize,
    /// Batch size the runner's handler declares
    pub max_event_count: usize,
    /// Invoke the handler with an empty batch when a receive times out
    pub invoke_on_timeout: bool,
}

/// Synthetic load fed into each partition by the container runner.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadSettings {
    pub messages_per_second: u32,
    pub payload_bytes: usize,
}

fn default_receive_timeout_ms() -> u64 {
    DEFAULT_RECEIVE_TIMEOUT_MS
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            max_event_count: DEFAULT_MAX_EVENT_COUNT,
            invoke_on_timeout: false,
        }
    }
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            messages_per_second: 100,
            payload_bytes: 256,
        }
    }
}

/// Runtime options a pump is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpOptions {
    pub prefetch_count: usize,
    pub invoke_on_timeout: bool,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            invoke_on_timeout: false,
        }
    }
}

impl PumpOptions {
    pub fn with_prefetch_count(mut self, prefetch_count: usize) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_invoke_on_timeout(mut self, invoke_on_timeout: bool) -> Self {
        self.invoke_on_timeout = invoke_on_timeout;
        self
    }
}

impl From<&PumpSettings> for PumpOptions {
    fn from(settings: &PumpSettings) -> Self {
        Self {
            prefetch_count: settings.prefetch_count,
            invoke_on_timeout: settings.invoke_on_timeout,
        }
    }
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<PumpConfig> {
    match config_path {
        Some(path) => PumpConfig::from_file(path),
        None => PumpConfig::from_env(),
    }
}

impl PumpConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        Self::from_yaml(&content).map_err(|e| {
            ConfigError::LoadFailed {
                location: path.to_string(),
                error: e.into(),
            }
            .into()
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config_str = std::env::var("PUMP_CONFIG")
            .map_err(|_| anyhow::anyhow!("PUMP_CONFIG environment variable not set"))?;
        let config = Self::from_yaml(&config_str).map_err(|e| ConfigError::LoadFailed {
            location: "PUMP_CONFIG".to_string(),
            error: e.into(),
        })?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "source.name".to_string(),
            });
        }
        if self.source.partitions.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "At least one partition must be configured".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for partition in &self.source.partitions {
            if partition.is_empty() {
                return Err(ConfigError::Invalid {
                    message: "Partition ids cannot be empty".to_string(),
                });
            }
            if !seen.insert(partition.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("Partition {} is listed more than once", partition),
                });
            }
        }

        if self.source.receive_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "Receive timeout must be positive".to_string(),
            });
        }

        let prefetch = self.pump.prefetch_count;
        if !(MINIMUM_PREFETCH_COUNT..=MAXIMUM_PREFETCH_COUNT).contains(&prefetch) {
            return Err(ConfigError::ValidationFailed {
                reason: format!(
                    "Prefetch count {} must be between {} and {}",
                    prefetch, MINIMUM_PREFETCH_COUNT, MAXIMUM_PREFETCH_COUNT
                ),
            });
        }

        let max_event_count = self.pump.max_event_count;
        if max_event_count == 0 || max_event_count > prefetch {
            return Err(ConfigError::ValidationFailed {
                reason: format!(
                    "Max event count {} must be between 1 and the prefetch count {}",
                    max_event_count, prefetch
                ),
            });
        }

        let rate = self.load.messages_per_second;
        if rate == 0 || rate > MAXIMUM_MESSAGES_PER_SECOND {
            return Err(ConfigError::ValidationFailed {
                reason: format!(
                    "Load rate {} must be between 1 and {} messages per second",
                    rate, MAXIMUM_MESSAGES_PER_SECOND
                ),
            });
        }

        Ok(())
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.source.receive_timeout_ms)
    }

    pub fn pump_options(&self) -> PumpOptions {
        PumpOptions::from(&self.pump)
    }
}
