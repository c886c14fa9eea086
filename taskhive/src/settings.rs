//! Process wide settings.
//!
//! Every field has a default so an empty file, or no file at all, is a valid configuration.
use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::config::ConfigError;

fn default_host_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

fn default_rpc_retry_base_ms() -> u64 {
    1_000
}

fn default_queue_retry_base_ms() -> u64 {
    5_000
}

fn default_pool_size() -> usize {
    4
}

fn default_cluster_registration() -> bool {
    true
}

fn default_workers() -> usize {
    8
}

fn default_backlog() -> usize {
    64
}

fn default_leader_key() -> String {
    "taskhive:leader".to_owned()
}

fn default_lease_ms() -> u64 {
    30_000
}

fn default_renew_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    /// This instance's identity, used in host dimensioned rate limit keys and cron targeting.
    #[serde(default = "default_host_id")]
    pub host_id: String,
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub croner: CronerSettings,
    #[serde(default)]
    pub overflow: OverflowSettings,
    #[serde(default)]
    pub leader: LeaderSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host_id: default_host_id(),
            runner: Default::default(),
            croner: Default::default(),
            overflow: Default::default(),
            leader: Default::default(),
        }
    }
}

impl Settings {
    pub const ENV_CONFIG_PATH: &'static str = "TASKHIVE_CONFIG";

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Loading settings");
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Loads from the file named by `TASKHIVE_CONFIG`, or the defaults when it is unset.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var(Self::ENV_CONFIG_PATH) {
            Ok(path) => Self::from_path(path),
            Err(_) => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunnerSettings {
    /// Base of the linear backoff for local resubmission of RPC and local calls.
    #[serde(default = "default_rpc_retry_base_ms")]
    pub rpc_retry_base_ms: u64,
    /// Base of the linear backoff for resubmission onto the queue.
    #[serde(default = "default_queue_retry_base_ms")]
    pub queue_retry_base_ms: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            rpc_retry_base_ms: default_rpc_retry_base_ms(),
            queue_retry_base_ms: default_queue_retry_base_ms(),
        }
    }
}

impl RunnerSettings {
    pub fn rpc_retry_base(&self) -> Duration {
        Duration::from_millis(self.rpc_retry_base_ms)
    }

    pub fn queue_retry_base(&self) -> Duration {
        Duration::from_millis(self.queue_retry_base_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CronerSettings {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Whether this instance registers the cluster's cron jobs at all.
    #[serde(default = "default_cluster_registration")]
    pub cluster_registration: bool,
}

impl Default for CronerSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            cluster_registration: default_cluster_registration(),
        }
    }
}

impl CronerSettings {
    /// With cluster registration disabled there is nothing to run concurrently.
    pub fn effective_pool_size(&self) -> usize {
        if self.cluster_registration {
            self.pool_size
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OverflowSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Invocations accepted beyond the busy workers before diverting to the queue.
    #[serde(default = "default_backlog")]
    pub backlog: usize,
}

impl Default for OverflowSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            backlog: default_backlog(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LeaderSettings {
    #[serde(default = "default_leader_key")]
    pub key: String,
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    #[serde(default = "default_renew_ms")]
    pub renew_ms: u64,
}

impl Default for LeaderSettings {
    fn default() -> Self {
        Self {
            key: default_leader_key(),
            lease_ms: default_lease_ms(),
            renew_ms: default_renew_ms(),
        }
    }
}

impl LeaderSettings {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn renew(&self) -> Duration {
        Duration::from_millis(self.renew_ms)
    }
}
