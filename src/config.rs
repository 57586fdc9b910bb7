//! Runtime Configuration
//!
//! Tunables shared by every component of a [`World`](crate::world::World).
//! Values come from a JSON file, from `WORLD_*` environment variables, or from
//! the defaults below.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "WORLD_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads in the per-process thread pool.
    pub worker_count: usize,
    /// Exchange rounds a fence may take before it is declared stalled.
    pub fence_max_rounds: u64,
    /// Upper bound for the pause between unbalanced fence rounds.
    pub fence_backoff_max_ms: u64,
    /// Empty polls the dispatch loop spins through before it starts sleeping.
    pub poll_idle_spins: u32,
    /// Sleep between empty polls once the poller is idle.
    pub poll_sleep_us: u64,
    /// Virtual partitions used by the default hash partition map.
    pub partitions: u32,
    /// Max level handed to the tracing subscriber by the binary.
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            worker_count: worker_count.max(1),
            fence_max_rounds: 100_000,
            fence_backoff_max_ms: 8,
            poll_idle_spins: 64,
            poll_sleep_us: 50,
            partitions: 256,
            log_level: "info".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Reads a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: RuntimeConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validated()
    }

    /// Defaults overridden by any `WORLD_*` variables present in the environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Applies `WORLD_*` overrides from an arbitrary variable source.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();

        for (name, value) in vars {
            let Some(field) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match field {
                "WORKER_COUNT" => config.worker_count = parse_var(&name, &value)?,
                "FENCE_MAX_ROUNDS" => config.fence_max_rounds = parse_var(&name, &value)?,
                "FENCE_BACKOFF_MAX_MS" => config.fence_backoff_max_ms = parse_var(&name, &value)?,
                "POLL_IDLE_SPINS" => config.poll_idle_spins = parse_var(&name, &value)?,
                "POLL_SLEEP_US" => config.poll_sleep_us = parse_var(&name, &value)?,
                "PARTITIONS" => config.partitions = parse_var(&name, &value)?,
                "LOG_LEVEL" => config.log_level = value,
                _ => tracing::warn!("Ignoring unknown config variable {}", name),
            }
        }

        config.validated()
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn fence_backoff_max(&self) -> Duration {
        Duration::from_millis(self.fence_backoff_max_ms)
    }

    pub fn poll_sleep(&self) -> Duration {
        Duration::from_micros(self.poll_sleep_us)
    }

    /// Parses `log_level`, falling back to INFO for unknown names.
    pub fn tracing_level(&self) -> tracing::Level {
        self.log_level
            .parse()
            .unwrap_or(tracing::Level::INFO)
    }

    fn validated(self) -> Result<Self> {
        anyhow::ensure!(self.worker_count > 0, "worker_count must be at least 1");
        anyhow::ensure!(self.fence_max_rounds > 1, "fence_max_rounds must be at least 2");
        anyhow::ensure!(self.partitions > 0, "partitions must be at least 1");
        Ok(self)
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    <T as std::str::FromStr>::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: <T as std::str::FromStr>::Err| anyhow::anyhow!("invalid {}={}: {}", name, value, e))
}
