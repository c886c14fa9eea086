//! Log and statistics side channels.
//!
//! Sinks are best effort. They are called synchronously from the runner and croner so an
//! implementation must not block; a sink shipping records elsewhere should hand them to a
//! channel or background task. Errors are logged by the caller and never affect the task.
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::task::{ExecutionState, TaskId, TaskInvocation};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),
    #[error("Error encoding record")]
    Encode(#[from] serde_json::Error),
}

/// A full record of one runner attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunnerLog {
    pub host_id: String,
    pub invocation: TaskInvocation,
}

/// A full record of one cron tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CronerLog {
    pub host_id: String,
    pub job_id: String,
    pub task_id: TaskId,
    pub task_class: String,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub state: ExecutionState,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Failure counters and phase latencies for a single runner attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub task_class: String,
    pub total: u64,
    pub program_failures: u64,
    pub config_failures: u64,
    pub data_failures: u64,
    pub partner_failures: u64,
    /// Enqueued to consumed.
    pub wait_ms: i64,
    /// Enqueued to started.
    pub queue_to_run_ms: i64,
    /// Started to finished.
    pub run_ms: i64,
}

impl From<&TaskInvocation> for RunnerStats {
    fn from(value: &TaskInvocation) -> Self {
        let counters = FailureCounters::from(value.state);
        Self {
            task_class: value.task_class.clone(),
            total: 1,
            program_failures: counters.program,
            config_failures: counters.config,
            data_failures: counters.data,
            partner_failures: counters.partner,
            wait_ms: millis(value.wait_time()),
            queue_to_run_ms: millis(value.queue_to_run()),
            run_ms: millis(value.run_time()),
        }
    }
}

/// Failure counters and latencies for a single cron tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CronerStats {
    pub job_id: String,
    pub total: u64,
    pub program_failures: u64,
    pub config_failures: u64,
    pub data_failures: u64,
    pub partner_failures: u64,
    /// Scheduled fire time to started, i.e. scheduling drift.
    pub wait_ms: i64,
    pub run_ms: i64,
    /// Finished to the next scheduled fire time.
    pub finish_to_next_ms: i64,
}

impl From<&CronerLog> for CronerStats {
    fn from(value: &CronerLog) -> Self {
        let counters = FailureCounters::from(value.state);
        Self {
            job_id: value.job_id.clone(),
            total: 1,
            program_failures: counters.program,
            config_failures: counters.config,
            data_failures: counters.data,
            partner_failures: counters.partner,
            wait_ms: (value.started_at - value.scheduled_at).num_milliseconds(),
            run_ms: (value.finished_at - value.started_at).num_milliseconds(),
            finish_to_next_ms: millis(value.next_fire_at.map(|next| next - value.finished_at)),
        }
    }
}

#[derive(Default)]
struct FailureCounters {
    program: u64,
    config: u64,
    data: u64,
    partner: u64,
}

impl From<ExecutionState> for FailureCounters {
    fn from(value: ExecutionState) -> Self {
        let mut counters = Self::default();
        match value {
            ExecutionState::FailProgram => counters.program = 1,
            ExecutionState::FailConfig => counters.config = 1,
            ExecutionState::FailData => counters.data = 1,
            ExecutionState::FailPartner => counters.partner = 1,
            ExecutionState::Success | ExecutionState::Unknown => {}
        }
        counters
    }
}

fn millis(delta: Option<TimeDelta>) -> i64 {
    delta.map_or(0, |delta| delta.num_milliseconds())
}

#[cfg_attr(test, mockall::automock)]
pub trait LogSink: Send + Sync {
    fn send_runner_log(&self, record: &RunnerLog) -> Result<(), SinkError>;

    fn send_croner_log(&self, job_id: &str, record: &CronerLog) -> Result<(), SinkError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait StatsSink: Send + Sync {
    fn update_runner_stats(&self, stats: &RunnerStats) -> Result<(), SinkError>;

    fn update_croner_stats(&self, stats: &CronerStats) -> Result<(), SinkError>;
}

/// Emits records as structured `tracing` events under the `taskhive::sink` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn send_runner_log(&self, record: &RunnerLog) -> Result<(), SinkError> {
        let invocation = serde_json::to_string(&record.invocation)?;
        tracing::info!(
            target: "taskhive::sink",
            host_id = %record.host_id,
            task_id = %record.invocation.id,
            task_class = %record.invocation.task_class,
            state = %record.invocation.state,
            %invocation,
            "runner log"
        );
        Ok(())
    }

    fn send_croner_log(&self, job_id: &str, record: &CronerLog) -> Result<(), SinkError> {
        tracing::info!(
            target: "taskhive::sink",
            host_id = %record.host_id,
            %job_id,
            task_class = %record.task_class,
            state = %record.state,
            scheduled_at = %record.scheduled_at,
            next_fire_at = ?record.next_fire_at,
            error = ?record.error,
            "croner log"
        );
        Ok(())
    }
}

impl StatsSink for TracingSink {
    fn update_runner_stats(&self, stats: &RunnerStats) -> Result<(), SinkError> {
        tracing::debug!(target: "taskhive::sink", ?stats, "runner stats");
        Ok(())
    }

    fn update_croner_stats(&self, stats: &CronerStats) -> Result<(), SinkError> {
        tracing::debug!(target: "taskhive::sink", ?stats, "croner stats");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::task::RunMode;

    #[test]
    fn runner_stats_counts_failure_class() {
        let mut invocation = TaskInvocation::new("report", RunMode::Queue, Value::Null)
            .with_enqueued_at(Utc::now() - TimeDelta::milliseconds(250));
        invocation.mark_consumed();
        invocation.mark_started();
        invocation.mark_finished(ExecutionState::FailPartner, None, None);

        let stats = RunnerStats::from(&invocation);

        assert_eq!(stats.total, 1);
        assert_eq!(stats.partner_failures, 1);
        assert_eq!(stats.program_failures + stats.config_failures + stats.data_failures, 0);
        assert!(stats.wait_ms >= 250);
        assert!(stats.queue_to_run_ms >= stats.wait_ms);
    }

    #[test]
    fn croner_stats_latencies() {
        let scheduled_at = Utc::now();
        let log = CronerLog {
            host_id: "host".to_owned(),
            job_id: "nightly".to_owned(),
            task_id: TaskId::from(1),
            task_class: "report".to_owned(),
            scheduled_at,
            started_at: scheduled_at + TimeDelta::milliseconds(5),
            finished_at: scheduled_at + TimeDelta::milliseconds(105),
            next_fire_at: Some(scheduled_at + TimeDelta::seconds(1)),
            state: ExecutionState::Success,
            result: None,
            error: None,
        };

        let stats = CronerStats::from(&log);

        assert_eq!(stats.wait_ms, 5);
        assert_eq!(stats.run_ms, 100);
        assert_eq!(stats.finish_to_next_ms, 895);
        assert_eq!(stats.total, 1);
    }
}
