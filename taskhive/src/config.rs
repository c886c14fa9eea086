//! Resolution of per call policy.
//!
//! The runner and croner look up task and cron definitions through a [`ConfigProvider`] on every
//! call so that reconfiguration takes effect without restarting them. [`DefinitionRegistry`] is
//! the in process provider: it holds an immutable snapshot that is swapped wholesale on update.
use std::{
    path::Path,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use fxhash::FxHashMap;
use serde::Deserialize;
use thiserror::Error;

use crate::task::{CronDefinition, TaskDefinition};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No definition for task class {0}")]
    UnknownTaskClass(String),
    #[error("No definition for cron job {0}")]
    UnknownCronJob(String),
    #[error("Config provider unavailable: {0}")]
    Unavailable(String),
    #[error("Error reading config file")]
    Io(#[from] std::io::Error),
    #[error("Error parsing config")]
    Parse(#[from] toml::de::Error),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn runner_definition(
        &self,
        task_class: &str,
    ) -> Result<Arc<TaskDefinition>, ConfigError>;

    async fn croner_definition(&self, job_id: &str) -> Result<Arc<CronDefinition>, ConfigError>;
}

/// An immutable set of definitions.
#[derive(Debug, Clone, Default)]
pub struct Definitions {
    runners: FxHashMap<String, Arc<TaskDefinition>>,
    crons: FxHashMap<String, Arc<CronDefinition>>,
}

impl Definitions {
    pub fn new(
        runners: impl IntoIterator<Item = TaskDefinition>,
        crons: impl IntoIterator<Item = CronDefinition>,
    ) -> Self {
        Self {
            runners: runners
                .into_iter()
                .map(|def| (def.task_class.clone(), Arc::new(def)))
                .collect(),
            crons: crons
                .into_iter()
                .map(|def| (def.job_id.clone(), Arc::new(def)))
                .collect(),
        }
    }

    /// Parses definitions from TOML with `[[task]]` and `[[cron]]` tables.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct File {
            #[serde(default)]
            task: Vec<TaskDefinition>,
            #[serde(default)]
            cron: Vec<CronDefinition>,
        }

        let file: File = toml::from_str(contents)?;
        Ok(Self::new(file.task, file.cron))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn runner(&self, task_class: &str) -> Option<&Arc<TaskDefinition>> {
        self.runners.get(task_class)
    }

    pub fn cron(&self, job_id: &str) -> Option<&Arc<CronDefinition>> {
        self.crons.get(job_id)
    }

    pub fn crons(&self) -> impl Iterator<Item = &Arc<CronDefinition>> {
        self.crons.values()
    }
}

/// A [`ConfigProvider`] over a swappable [`Definitions`] snapshot.
///
/// Readers clone the current snapshot's [`Arc`] and never observe a partially applied update.
/// Cloning the registry is cheap; clones share the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    snapshot: Arc<RwLock<Arc<Definitions>>>,
}

impl DefinitionRegistry {
    pub fn new(definitions: Definitions) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(Arc::new(definitions))),
        }
    }

    pub fn snapshot(&self) -> Arc<Definitions> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swaps in a complete new set of definitions, returning the previous one.
    pub fn replace_all(&self, definitions: Definitions) -> Arc<Definitions> {
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *snapshot, Arc::new(definitions))
    }

    pub fn upsert_runner(&self, definition: TaskDefinition) {
        self.update(|definitions| {
            definitions
                .runners
                .insert(definition.task_class.clone(), Arc::new(definition));
        });
    }

    pub fn upsert_cron(&self, definition: CronDefinition) {
        self.update(|definitions| {
            definitions
                .crons
                .insert(definition.job_id.clone(), Arc::new(definition));
        });
    }

    fn update(&self, f: impl FnOnce(&mut Definitions)) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Definitions::clone(&snapshot);
        f(&mut next);
        *snapshot = Arc::new(next);
    }
}

#[async_trait]
impl ConfigProvider for DefinitionRegistry {
    async fn runner_definition(
        &self,
        task_class: &str,
    ) -> Result<Arc<TaskDefinition>, ConfigError> {
        self.snapshot()
            .runner(task_class)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownTaskClass(task_class.to_owned()))
    }

    async fn croner_definition(&self, job_id: &str) -> Result<Arc<CronDefinition>, ConfigError> {
        self.snapshot()
            .cron(job_id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownCronJob(job_id.to_owned()))
    }
}
