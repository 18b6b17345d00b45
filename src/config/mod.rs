//! Worker configuration.
//!
//! Jobs are described by a JSON document:
//!
//! ```json
//! {
//!   "store": { "url": "memory://" },
//!   "jobs": [
//!     { "name": "reports", "resource": "a1416b2940b34bbb9189caaa13f11b1a", "poll_interval_secs": 30 },
//!     { "name": "cleanup", "resource": "cleanup", "backoff": { "kind": "fixed", "delay_ms": 500 } }
//!   ]
//! }
//! ```
//!
//! Environment variables override the document: `LOCKJOB_STORE_URL` replaces
//! the store location and `LOCKJOB_POLL_INTERVAL_SECS` the cadence of every job.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::job::Backoff;
use crate::lock::MemoryLockStore;

pub const STORE_URL_ENV: &str = "LOCKJOB_STORE_URL";
pub const POLL_INTERVAL_ENV: &str = "LOCKJOB_POLL_INTERVAL_SECS";

const DEFAULT_STORE_URL: &str = "memory://";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_BACKOFF_FACTOR: u32 = 2;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value `{value}` for {var}")]
    Env { var: &'static str, value: String },

    #[error("job `{job}` has an empty resource identifier")]
    EmptyResource { job: String },

    #[error("resource `{resource}` is claimed by more than one job")]
    DuplicateResource { resource: String },

    #[error("job `{job}` has a zero poll interval")]
    ZeroInterval { job: String },

    #[error("store `{url}` is not an in-process store")]
    UnsupportedStore { url: String },
}

/// Top-level worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// Location of the lock backing store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
        }
    }
}

impl StoreConfig {
    /// Returns `true` if the store lives in this process.
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory:")
    }

    /// Builds the in-process store for a `memory:` URL.
    ///
    /// Any other URL names an external store; construct its client from
    /// [`url`](Self::url) and pass it to the [`JobContext`](crate::job::JobContext).
    pub fn memory_store(&self) -> Result<MemoryLockStore, ConfigError> {
        if !self.is_memory() {
            return Err(ConfigError::UnsupportedStore {
                url: self.url.clone(),
            });
        }
        debug!(url = %self.url, "using in-process lock store");
        Ok(MemoryLockStore::new())
    }
}

/// One lock-gated job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobConfig {
    pub name: String,

    /// Identifier of the protected resource. Must be the same on every
    /// instance that runs this job.
    pub resource: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl JobConfig {
    pub fn new(name: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource: resource.into(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            backoff: BackoffConfig::None,
        }
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Serialized form of [`Backoff`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    #[default]
    None,
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        #[serde(default = "default_backoff_factor")]
        factor: u32,
    },
}

impl From<BackoffConfig> for Backoff {
    fn from(config: BackoffConfig) -> Self {
        match config {
            BackoffConfig::None => Backoff::None,
            BackoffConfig::Fixed { delay_ms } => Backoff::Fixed(Duration::from_millis(delay_ms)),
            BackoffConfig::Exponential {
                initial_ms,
                max_ms,
                factor,
            } => Backoff::Exponential {
                initial: Duration::from_millis(initial_ms),
                max: Duration::from_millis(max_ms),
                factor,
            },
        }
    }
}

fn default_store_url() -> String {
    DEFAULT_STORE_URL.to_owned()
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_backoff_factor() -> u32 {
    DEFAULT_BACKOFF_FACTOR
}

impl WorkerConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON file, applies environment overrides, and validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Self = serde_json::from_str(&contents)?;
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        debug!(path = %path.display(), jobs = config.jobs.len(), "loaded worker config");
        Ok(config)
    }

    /// Applies overrides from `lookup`, normally backed by the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(STORE_URL_ENV) {
            self.store.url = url;
        }

        if let Some(value) = lookup(POLL_INTERVAL_ENV) {
            let secs: u64 = value.trim().parse().map_err(|_| ConfigError::Env {
                var: POLL_INTERVAL_ENV,
                value: value.clone(),
            })?;
            for job in &mut self.jobs {
                job.poll_interval_secs = secs;
            }
        }
        Ok(())
    }

    /// Checks that every job has a distinct, non-empty resource and a
    /// non-zero cadence.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.resource.trim().is_empty() {
                return Err(ConfigError::EmptyResource {
                    job: job.name.clone(),
                });
            }
            if job.poll_interval_secs == 0 {
                return Err(ConfigError::ZeroInterval {
                    job: job.name.clone(),
                });
            }
            if !seen.insert(job.resource.as_str()) {
                return Err(ConfigError::DuplicateResource {
                    resource: job.resource.clone(),
                });
            }
        }
        Ok(())
    }
}
