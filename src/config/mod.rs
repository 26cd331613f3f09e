pub mod env;
pub use env::apply_env_overrides;

use serde::Deserialize;
use std::time::Duration;

/// Complete configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub frames: FrameConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Provider-side subscription registry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Entity used as the serialization frame when no target frame is set
    #[serde(default = "default_origin_entity_id")]
    pub origin_entity_id: String,
    /// Two tick times closer than this (seconds) share cached entity states
    #[serde(default = "default_cache_time_epsilon")]
    pub cache_time_epsilon_seconds: f64,
}

fn default_origin_entity_id() -> String {
    "ar.origin".to_string()
}

fn default_cache_time_epsilon() -> f64 {
    1e-6
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            origin_entity_id: default_origin_entity_id(),
            cache_time_epsilon_seconds: default_cache_time_epsilon(),
        }
    }
}

/// Frame-chain resolution configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FrameConfig {
    /// Longest chain of entity frames followed before giving up
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_max_depth() -> usize {
    32
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

/// Demo loop configuration (binary only)
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_ticks")]
    pub ticks: u64,
}

fn default_tick_interval() -> u64 {
    100
}

fn default_ticks() -> u64 {
    20
}

impl SimulationConfig {
    /// Tick period, at least one millisecond
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            ticks: default_ticks(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<SyncConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: SyncConfig = toml::from_str(&contents)?;
    Ok(config)
}
