//! Helpers for testing code that embeds taskhive.
//!
//! [`ScriptedExecutor`] runs whatever [`Script`] it is handed as payload, and [`RecordingSink`]
//! keeps every log and statistics record in memory for inspection.
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    executor::{DataError, ExecutionError, ExecutionResult, Executor, PartnerError},
    sink::{CronerLog, CronerStats, LogSink, RunnerLog, RunnerStats, SinkError, StatsSink},
    task::Task,
};

/// What a [`ScriptedExecutor`] does when run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Script {
    Done,
    Output(Value),
    DataError,
    PartnerError,
    ProgramError,
    Panic,
    Sleep { millis: u64 },
    /// Outputs the attempt number it was run as.
    EchoAttempt,
}

#[derive(Debug, Error)]
#[error("scripted failure")]
struct ScriptedFailure;

impl ExecutionError for ScriptedFailure {
    fn error_type(&self) -> &'static str {
        "scripted"
    }
}

/// An executor for the `scripted` task class that follows the [`Script`] in its payload.
///
/// Clones share the execution counter.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    executions: Arc<AtomicUsize>,
}

impl ScriptedExecutor {
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    type Data = Script;
    const NAME: &'static str = "scripted";

    async fn execute(&self, task: Task<Self::Data>) -> ExecutionResult {
        self.executions.fetch_add(1, Ordering::SeqCst);
        match task.data {
            Script::Done => ExecutionResult::Done,
            Script::Output(result) => ExecutionResult::Output { result },
            Script::DataError => DataError("scripted bad input".to_owned()).into(),
            Script::PartnerError => PartnerError("scripted partner outage".to_owned()).into(),
            Script::ProgramError => ScriptedFailure.into(),
            Script::Panic => panic!("scripted panic"),
            Script::Sleep { millis } => {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                ExecutionResult::Done
            }
            Script::EchoAttempt => ExecutionResult::Output {
                result: task.attempt.into(),
            },
        }
    }
}

#[derive(Debug, Default)]
struct Records {
    runner_logs: Vec<RunnerLog>,
    croner_logs: Vec<CronerLog>,
    runner_stats: Vec<RunnerStats>,
    croner_stats: Vec<CronerStats>,
}

/// A log and stats sink that keeps every record.
///
/// Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    records: Arc<Mutex<Records>>,
}

impl RecordingSink {
    fn with_records<T>(&self, f: impl FnOnce(&mut Records) -> T) -> T {
        f(&mut self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn runner_logs(&self) -> Vec<RunnerLog> {
        self.with_records(|records| records.runner_logs.clone())
    }

    pub fn croner_logs(&self) -> Vec<CronerLog> {
        self.with_records(|records| records.croner_logs.clone())
    }

    pub fn runner_stats(&self) -> Vec<RunnerStats> {
        self.with_records(|records| records.runner_stats.clone())
    }

    pub fn croner_stats(&self) -> Vec<CronerStats> {
        self.with_records(|records| records.croner_stats.clone())
    }
}

impl LogSink for RecordingSink {
    fn send_runner_log(&self, record: &RunnerLog) -> Result<(), SinkError> {
        self.with_records(|records| records.runner_logs.push(record.clone()));
        Ok(())
    }

    fn send_croner_log(&self, _job_id: &str, record: &CronerLog) -> Result<(), SinkError> {
        self.with_records(|records| records.croner_logs.push(record.clone()));
        Ok(())
    }
}

impl StatsSink for RecordingSink {
    fn update_runner_stats(&self, stats: &RunnerStats) -> Result<(), SinkError> {
        self.with_records(|records| records.runner_stats.push(stats.clone()));
        Ok(())
    }

    fn update_croner_stats(&self, stats: &CronerStats) -> Result<(), SinkError> {
        self.with_records(|records| records.croner_stats.push(stats.clone()));
        Ok(())
    }
}
