//! Engine configuration.

use crate::anomaly::{ScorerWeights, SeverityThresholds};
use crate::profile::MaturityThresholds;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub flows: FlowConfig,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub profiles: ProfileConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
}

/// Session engine timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_tcp_idle_secs")]
    pub tcp_idle_secs: u64,

    #[serde(default = "default_udp_idle_secs")]
    pub udp_idle_secs: u64,
}

/// Flow table lifecycle.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    /// Idle threshold after which a flow is evicted.
    #[serde(default = "default_flow_idle_secs")]
    pub idle_secs: u64,
}

/// TUN read buffer pool.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Profile maturity gates.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileConfig {
    #[serde(default = "default_learning_at")]
    pub learning_at: u64,

    #[serde(default = "default_mature_at")]
    pub mature_at: u64,
}

/// Scorer fusion knobs.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AnomalyConfig {
    #[serde(default)]
    pub weights: ScorerWeights,

    #[serde(default)]
    pub thresholds: SeverityThresholds,
}

fn default_tcp_idle_secs() -> u64 {
    120
}
fn default_udp_idle_secs() -> u64 {
    60
}
fn default_flow_idle_secs() -> u64 {
    30
}
fn default_pool_size() -> usize {
    crate::buffer_pool::DEFAULT_POOL_SIZE
}
fn default_buffer_size() -> usize {
    crate::buffer_pool::DEFAULT_BUFFER_SIZE
}
fn default_learning_at() -> u64 {
    30
}
fn default_mature_at() -> u64 {
    200
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tcp_idle_secs: default_tcp_idle_secs(),
            udp_idle_secs: default_udp_idle_secs(),
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            idle_secs: default_flow_idle_secs(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            learning_at: default_learning_at(),
            mature_at: default_mature_at(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.proxy.tcp_idle_secs == 0 || self.proxy.udp_idle_secs == 0 {
            anyhow::bail!("Session idle timeouts must be non-zero");
        }
        if self.flows.idle_secs == 0 {
            anyhow::bail!("Flow idle threshold must be non-zero");
        }
        if self.buffers.buffer_size < 1500 {
            anyhow::bail!("Buffer size must cover at least one MTU-sized datagram");
        }
        if self.profiles.learning_at == 0 || self.profiles.learning_at >= self.profiles.mature_at {
            anyhow::bail!(
                "Maturity thresholds must satisfy 0 < learning ({}) < mature ({})",
                self.profiles.learning_at,
                self.profiles.mature_at
            );
        }
        if !self.anomaly.weights.is_valid() {
            anyhow::bail!("Scorer weights must lie in [0,1] and sum to at most 1.01");
        }
        let t = &self.anomaly.thresholds;
        if !(0.0 < t.low && t.low < t.medium && t.medium < t.high && t.high <= 1.0) {
            anyhow::bail!("Severity thresholds must be strictly increasing within (0,1]");
        }
        Ok(())
    }

    pub fn tcp_idle(&self) -> Duration {
        Duration::from_secs(self.proxy.tcp_idle_secs)
    }

    pub fn udp_idle(&self) -> Duration {
        Duration::from_secs(self.proxy.udp_idle_secs)
    }

    pub fn flow_idle(&self) -> Duration {
        Duration::from_secs(self.flows.idle_secs)
    }

    pub fn maturity_thresholds(&self) -> MaturityThresholds {
        MaturityThresholds {
            learning_at: self.profiles.learning_at,
            mature_at: self.profiles.mature_at,
        }
    }
}
