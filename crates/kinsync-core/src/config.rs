//! Application configuration management.
//!
//! Configuration is stored at `~/.config/kinsync/config.json`. Every field is
//! optional in the file; missing fields take their defaults. The environment
//! variables `KINSYNC_REMOTE_URL` and `KINSYNC_DATA_DIR` override the file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::app::AppSettings;
use crate::ops::MutationPolicy;
use crate::sync::{Backoff, EngineConfig, RetryPolicy};

/// Application name used for config/data directory paths
const APP_NAME: &str = "kinsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_REMOTE_URL: &str = "KINSYNC_REMOTE_URL";
const ENV_DATA_DIR: &str = "KINSYNC_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the remote store. Without one the client stays offline.
    pub remote_url: Option<String>,
    /// Overrides the platform data directory.
    pub data_dir: Option<PathBuf>,
    /// Maximum family graphs held in memory; unbounded when absent.
    pub memory_capacity: Option<usize>,
    pub max_attempts: u32,
    /// Initial automatic retry delay. Absent disables automatic retries.
    pub backoff_initial_ms: Option<u64>,
    pub backoff_max_ms: u64,
    pub backoff_jitter_ms: u64,
    pub probe_interval_secs: u64,
    pub queue_cascaded_edge_deletes: bool,
    pub validate_edge_endpoints: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_url: None,
            data_dir: None,
            memory_capacity: None,
            max_attempts: crate::sync::engine::DEFAULT_MAX_ATTEMPTS,
            backoff_initial_ms: None,
            backoff_max_ms: 60_000,
            backoff_jitter_ms: 1_000,
            probe_interval_secs: 30,
            queue_cascaded_edge_deletes: false,
            validate_edge_endpoints: false,
        }
    }
}

impl Config {
    /// Load from the config file (defaults if it does not exist), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_REMOTE_URL).filter(|v| !v.trim().is_empty()) {
            self.remote_url = Some(url);
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.trim().is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    /// Directory holding cached graphs, queued operations and logs.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: self.backoff_initial_ms.map(|initial| Backoff {
                initial: Duration::from_millis(initial),
                max: Duration::from_millis(self.backoff_max_ms.max(initial)),
                jitter: Duration::from_millis(self.backoff_jitter_ms),
            }),
        }
    }

    pub fn mutation_policy(&self) -> MutationPolicy {
        MutationPolicy {
            queue_cascaded_edge_deletes: self.queue_cascaded_edge_deletes,
            validate_edge_endpoints: self.validate_edge_endpoints,
        }
    }

    /// Settings for `App::open`. Starts offline; the connectivity probe
    /// flips it online once the remote answers.
    pub fn app_settings(&self) -> AppSettings {
        AppSettings {
            start_online: false,
            memory_capacity: self.memory_capacity,
            engine: EngineConfig {
                retry: self.retry_policy(),
                auto_drain: true,
            },
            policy: self.mutation_policy(),
        }
    }
}
