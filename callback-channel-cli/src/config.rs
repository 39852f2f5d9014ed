//! Scenario configuration loading and parsing

use anyhow::{bail, Context, Result};
use callback_channel::ChannelConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main application configuration (loaded from scenario.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub scenario: LoadConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Shape of the generated load
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadConfig {
    /// Number of producer threads
    #[serde(default = "default_producers")]
    pub producers: usize,
    /// Requests each producer enqueues
    #[serde(default = "default_requests")]
    pub requests_per_producer: usize,
    /// Every n-th request targets a released handle (0 = never)
    #[serde(default)]
    pub unregistered_every: usize,
    /// Every n-th request targets a callback that fails (0 = never)
    #[serde(default)]
    pub failing_every: usize,
    /// Upper bound on how long the consumer sleeps between drain cycles
    #[serde(default = "default_drain_interval")]
    pub drain_interval_ms: u64,
}

fn default_producers() -> usize {
    4
}

fn default_requests() -> usize {
    1000
}

fn default_drain_interval() -> u64 {
    10
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            producers: default_producers(),
            requests_per_producer: default_requests(),
            unregistered_every: 0,
            failing_every: 0,
            drain_interval_ms: default_drain_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Txt,
    Json,
}

impl ScenarioConfig {
    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<()> {
        if self.scenario.producers == 0 {
            bail!("scenario.producers must be at least 1");
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<ScenarioConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: ScenarioConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config
        .validate()
        .with_context(|| format!("Invalid config file: {:?}", path))?;

    Ok(config)
}
