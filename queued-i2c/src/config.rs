//! Configuration for queued-i2c.
//!
//! Values come from built-in defaults, optionally a JSON file, then
//! environment variables. Command-line flags override all of them.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Bus selection
    pub bus: BusConfig,

    /// Transaction queue settings
    pub queue: QueueConfig,
}

/// Which bus to open.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bus number, as in `/dev/i2c-N`
    pub channel: u32,

    /// Directory holding the `i2c-N` device nodes
    pub device_dir: PathBuf,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel: 1,
            device_dir: PathBuf::from("/dev"),
        }
    }
}

/// Transaction queue settings.
///
/// Only the number of waiting submissions is configurable; execution
/// concurrency is always one.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Submissions buffered before `submit` waits for room
    pub depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { depth: 16 }
    }
}

impl Config {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a JSON file, then apply environment
    /// overrides. Missing keys take their defaults.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Some(channel) = env_var("QI2C_CHANNEL")? {
            self.bus.channel = channel;
        }
        if let Ok(dir) = env::var("QI2C_DEVICE_DIR") {
            self.bus.device_dir = PathBuf::from(dir);
        }
        if let Some(depth) = env_var("QI2C_QUEUE_DEPTH")? {
            self.queue.depth = depth;
        }
        Ok(())
    }
}

fn env_var<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {name}={value:?}")),
        Err(_) => Ok(None),
    }
}
