//! The task invocation that flows through the runner, and the definitions that drive it.
//!
//! A [`TaskInvocation`] represents a single physical attempt at running a task. Retrying never
//! mutates a finished invocation, instead [`TaskInvocation::next_attempt`] produces a fresh copy
//! with the execution phase cleared.
use std::{fmt::Display, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

pub mod definition;

pub use definition::{
    CronDefinition, CronState, DelayMode, LogVerbosity, RateLimit, RateLimitDimension,
    RetryPolicy, RunType, TargetSelector, TaskDefinition,
};

/// The logical identity of a task, shared by every attempt at running it.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<TaskId> for u64 {
    fn from(value: TaskId) -> Self {
        value.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

/// How an invocation reached the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Delivered by the queue transport.
    Queue,
    /// Delivered by a remote procedure call.
    Rpc,
    /// Submitted from within this process.
    Local,
}

impl RunMode {
    /// RPC and local calls are answered directly rather than through the queue.
    pub fn is_direct(self) -> bool {
        matches!(self, Self::Rpc | Self::Local)
    }
}

/// The terminal state of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    Unknown,
    Success,
    /// An unexpected failure in the task body, treated as a bug.
    FailProgram,
    /// Admission was denied by the rate limiter.
    FailConfig,
    /// The input to this invocation is invalid.
    FailData,
    /// A dependency of the task body failed.
    FailPartner,
}

impl ExecutionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Success => "success",
            Self::FailProgram => "fail_program",
            Self::FailConfig => "fail_config",
            Self::FailData => "fail_data",
            Self::FailPartner => "fail_partner",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::FailProgram | Self::FailConfig | Self::FailData | Self::FailPartner
        )
    }

    /// Only overload and partner failures are ever resubmitted.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::FailConfig | Self::FailPartner)
    }
}

impl Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single attempt at running a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub id: TaskId,
    pub task_class: String,
    pub run_mode: RunMode,
    /// Free form value used to partition rate limits, e.g. a partner id.
    pub rate_limit_tag: Option<String>,
    pub ran_times: u32,
    /// The requested delivery delay, measured from `enqueued_at`.
    pub delay: Option<Duration>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub payload: Value,
    pub ref_object: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub state: ExecutionState,
}

impl TaskInvocation {
    pub fn new(task_class: impl Into<String>, run_mode: RunMode, payload: Value) -> Self {
        Self {
            id: TaskId::random(),
            task_class: task_class.into(),
            run_mode,
            rate_limit_tag: None,
            ran_times: 0,
            delay: None,
            enqueued_at: Some(Utc::now()),
            consumed_at: None,
            started_at: None,
            finished_at: None,
            payload,
            ref_object: None,
            result: None,
            error: None,
            state: ExecutionState::Unknown,
        }
    }

    pub fn with_id(self, id: TaskId) -> Self {
        Self { id, ..self }
    }

    pub fn with_tag(self, tag: impl Into<String>) -> Self {
        Self {
            rate_limit_tag: Some(tag.into()),
            ..self
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    pub fn with_enqueued_at(self, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            enqueued_at: Some(enqueued_at),
            ..self
        }
    }

    pub fn with_ref_object(self, ref_object: Value) -> Self {
        Self {
            ref_object: Some(ref_object),
            ..self
        }
    }

    /// Builds the copy used for the next attempt.
    ///
    /// Identity, routing and the attempt counter carry over; everything produced by executing
    /// this attempt is cleared.
    pub fn next_attempt(&self) -> Self {
        Self {
            id: self.id,
            task_class: self.task_class.clone(),
            run_mode: self.run_mode,
            rate_limit_tag: self.rate_limit_tag.clone(),
            ran_times: self.ran_times,
            delay: None,
            enqueued_at: Some(Utc::now()),
            consumed_at: None,
            started_at: None,
            finished_at: None,
            payload: self.payload.clone(),
            ref_object: None,
            result: None,
            error: None,
            state: ExecutionState::Unknown,
        }
    }

    /// How much of the requested delay is still outstanding at `now`.
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        let delay = TimeDelta::from_std(self.delay?).ok()?;
        let elapsed = now - self.enqueued_at?;
        (delay - elapsed).to_std().ok()
    }

    /// Time between being enqueued and being consumed.
    pub fn wait_time(&self) -> Option<TimeDelta> {
        Some(self.consumed_at? - self.enqueued_at?)
    }

    /// Time between being enqueued and the task body starting.
    pub fn queue_to_run(&self) -> Option<TimeDelta> {
        Some(self.started_at? - self.enqueued_at?)
    }

    pub fn run_time(&self) -> Option<TimeDelta> {
        Some(self.finished_at? - self.started_at?)
    }

    pub(crate) fn mark_consumed(&mut self) {
        self.consumed_at = Some(not_before(self.enqueued_at));
        self.ran_times += 1;
    }

    pub(crate) fn mark_started(&mut self) {
        self.started_at = Some(not_before(self.consumed_at));
    }

    pub(crate) fn mark_finished(
        &mut self,
        state: ExecutionState,
        result: Option<Value>,
        error: Option<String>,
    ) {
        self.finished_at = Some(not_before(self.started_at.or(self.consumed_at)));
        self.state = state;
        self.result = result;
        self.error = error;
    }
}

// The enqueue stamp may come from another host's clock.
fn not_before(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    previous.map_or(now, |previous| previous.max(now))
}

/// The typed view of an invocation handed to an [`crate::executor::Executor`].
#[derive(Debug, Clone)]
pub struct Task<D> {
    pub id: TaskId,
    pub task_class: String,
    pub run_mode: RunMode,
    pub tag: Option<String>,
    /// The attempt number, starting at one.
    pub attempt: u32,
    pub data: D,
    pub ref_object: Option<Value>,
}

impl<D> TryFrom<&TaskInvocation> for Task<D>
where
    D: DeserializeOwned,
{
    type Error = serde_json::Error;

    fn try_from(value: &TaskInvocation) -> Result<Self, Self::Error> {
        let data = serde_json::from_value(value.payload.clone())?;
        Ok(Self {
            id: value.id,
            task_class: value.task_class.clone(),
            run_mode: value.run_mode,
            tag: value.rate_limit_tag.clone(),
            attempt: value.ran_times,
            data,
            ref_object: value.ref_object.clone(),
        })
    }
}
