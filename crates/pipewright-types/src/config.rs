//! Engine configuration.
//!
//! `EngineConfig` represents `{data_dir}/config.toml`. Every field has a
//! default so an empty or missing file yields a working engine.

use serde::{Deserialize, Serialize};

use crate::stage::RetryPolicy;

/// Top-level configuration for a Pipewright engine and its workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Queue assigned to stages that do not request one.
    #[serde(default = "default_queue")]
    pub default_queue: String,

    /// Retry policy for stages that do not override it.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Maximum number of dispatches executed concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// SQLite URL; defaults to `{data_dir}/pipewright.db`.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Shared secret for signed or bearer resumption signals.
    #[serde(default)]
    pub callback_secret: Option<String>,
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_workers() -> usize {
    8
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_queue: default_queue(),
            retry: RetryPolicy::default(),
            workers: default_workers(),
            event_capacity: default_event_capacity(),
            database_url: None,
            callback_secret: None,
        }
    }
}
