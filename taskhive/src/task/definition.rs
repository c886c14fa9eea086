//! Per task class and per cron job policy.
//!
//! Definitions are immutable once loaded. Reconfiguration swaps in new definitions via
//! [`crate::config::DefinitionRegistry`] rather than editing them in place.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ExecutionState;

/// Which bucket an invocation is checked against during admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitDimension {
    /// Admission is always granted.
    #[default]
    None,
    /// A single process wide budget.
    Local,
    /// A process local budget per task class.
    LocalTask,
    /// A process local budget per task class and caller supplied tag.
    LocalTaskTag,
    /// A cluster wide budget per task class.
    GlobalTask,
    /// A cluster wide budget per task class and tag.
    GlobalTaskTag,
    /// A cluster backed budget per task class on this host.
    GlobalTaskHost,
    /// A cluster backed budget per task class and tag on this host.
    GlobalTaskTagHost,
}

impl RateLimitDimension {
    pub fn is_enabled(self) -> bool {
        self != Self::None
    }

    pub fn is_global(self) -> bool {
        matches!(
            self,
            Self::GlobalTask | Self::GlobalTaskTag | Self::GlobalTaskHost | Self::GlobalTaskTagHost
        )
    }
}

fn default_permits() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default)]
    pub dimension: RateLimitDimension,
    /// Permits granted per window.
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub window_secs: u64,
    /// How long admission may wait for a permit before the invocation is denied.
    #[serde(default)]
    pub max_wait_secs: u64,
    #[serde(default = "default_permits")]
    pub permits: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            dimension: RateLimitDimension::None,
            limit: 0,
            window_secs: 0,
            max_wait_secs: 0,
            permits: default_permits(),
        }
    }
}

impl RateLimit {
    pub fn new(dimension: RateLimitDimension, limit: u32, window: Duration) -> Self {
        Self {
            dimension,
            limit,
            window_secs: window.as_secs(),
            ..Default::default()
        }
    }

    pub fn with_max_wait(self, max_wait: Duration) -> Self {
        Self {
            max_wait_secs: max_wait.as_secs(),
            ..self
        }
    }

    pub fn with_permits(self, permits: u32) -> Self {
        Self { permits, ..self }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

fn default_threshold() -> u32 {
    3
}

/// Retry thresholds per retryable failure class.
///
/// An attempt is resubmitted while `ran_times` is below the threshold for its failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Enables local resubmission for RPC and local calls.
    #[serde(default)]
    pub auto_retry: bool,
    /// Threshold for invocations denied by admission control.
    #[serde(default = "default_threshold")]
    pub overload_threshold: u32,
    /// Threshold for partner failures.
    #[serde(default = "default_threshold")]
    pub partner_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            auto_retry: false,
            overload_threshold: default_threshold(),
            partner_threshold: default_threshold(),
        }
    }
}

impl RetryPolicy {
    pub fn automatic(overload_threshold: u32, partner_threshold: u32) -> Self {
        Self {
            auto_retry: true,
            overload_threshold,
            partner_threshold,
        }
    }

    /// Whether an attempt that ended in `state` after `ran_times` attempts is still within
    /// budget.
    pub fn allows(&self, state: ExecutionState, ran_times: u32) -> bool {
        match state {
            ExecutionState::FailConfig => ran_times < self.overload_threshold,
            ExecutionState::FailPartner => ran_times < self.partner_threshold,
            _ => false,
        }
    }
}

/// Whether a requested delivery delay is honoured by the transport or emulated by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayMode {
    #[default]
    Native,
    /// The runner sleeps out the remainder of the delay, holding its worker for that time.
    Emulated,
}

/// Controls which attempts produce a full log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogVerbosity {
    Off,
    #[default]
    Failures,
    All,
}

impl LogVerbosity {
    pub fn admits(self, state: ExecutionState) -> bool {
        match self {
            Self::Off => false,
            Self::Failures => state.is_failure(),
            Self::All => true,
        }
    }
}

/// Policy for one task class executed by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_class: String,
    #[serde(default)]
    pub rate_limit: RateLimit,
    #[serde(default)]
    pub delay_mode: DelayMode,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub log_verbosity: LogVerbosity,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TaskDefinition {
    pub fn new(task_class: impl Into<String>) -> Self {
        Self {
            task_class: task_class.into(),
            rate_limit: Default::default(),
            delay_mode: Default::default(),
            retry: Default::default(),
            log_verbosity: Default::default(),
            timeout_ms: None,
        }
    }

    pub fn with_rate_limit(self, rate_limit: RateLimit) -> Self {
        Self { rate_limit, ..self }
    }

    pub fn with_delay_mode(self, delay_mode: DelayMode) -> Self {
        Self { delay_mode, ..self }
    }

    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    pub fn with_log_verbosity(self, log_verbosity: LogVerbosity) -> Self {
        Self {
            log_verbosity,
            ..self
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout_ms: Some(timeout.as_millis() as u64),
            ..self
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Whether a cron job runs on every instance or only on the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    /// Runs on at most one instance per tick, the holder of the leader lock.
    #[default]
    Singleton,
    /// Runs on every targeted instance.
    Replicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronState {
    Removed,
    Disabled,
    #[default]
    Active,
}

/// Which instances a cron job is registered on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSelector {
    #[default]
    All,
    Hosts(Vec<String>),
}

impl TargetSelector {
    pub fn matches(&self, host_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Hosts(hosts) => hosts.iter().any(|host| host == host_id),
        }
    }
}

/// A recurring job run by the croner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronDefinition {
    pub job_id: String,
    pub task_class: String,
    /// A cron expression with a leading seconds field, e.g. `0 */5 * * * *`.
    pub schedule: String,
    #[serde(default)]
    pub run_type: RunType,
    #[serde(default)]
    pub state: CronState,
    #[serde(default)]
    pub target: TargetSelector,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub log_verbosity: LogVerbosity,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl CronDefinition {
    pub fn new(
        job_id: impl Into<String>,
        task_class: impl Into<String>,
        schedule: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            task_class: task_class.into(),
            schedule: schedule.into(),
            run_type: Default::default(),
            state: Default::default(),
            target: Default::default(),
            payload: Value::Null,
            log_verbosity: Default::default(),
            timeout_ms: None,
        }
    }

    pub fn with_run_type(self, run_type: RunType) -> Self {
        Self { run_type, ..self }
    }

    pub fn with_state(self, state: CronState) -> Self {
        Self { state, ..self }
    }

    pub fn with_target(self, target: TargetSelector) -> Self {
        Self { target, ..self }
    }

    pub fn with_payload(self, payload: Value) -> Self {
        Self { payload, ..self }
    }

    pub fn with_log_verbosity(self, log_verbosity: LogVerbosity) -> Self {
        Self {
            log_verbosity,
            ..self
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout_ms: Some(timeout.as_millis() as u64),
            ..self
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_thresholds() {
        let policy = RetryPolicy::automatic(2, 3);

        assert!(policy.allows(ExecutionState::FailConfig, 1));
        assert!(!policy.allows(ExecutionState::FailConfig, 2));
        assert!(policy.allows(ExecutionState::FailPartner, 2));
        assert!(!policy.allows(ExecutionState::FailPartner, 3));
        assert!(!policy.allows(ExecutionState::FailProgram, 0));
        assert!(!policy.allows(ExecutionState::FailData, 0));
        assert!(!policy.allows(ExecutionState::Success, 0));
    }

    #[test]
    fn log_verbosity() {
        assert!(!LogVerbosity::Off.admits(ExecutionState::FailProgram));
        assert!(LogVerbosity::Failures.admits(ExecutionState::FailData));
        assert!(!LogVerbosity::Failures.admits(ExecutionState::Success));
        assert!(LogVerbosity::All.admits(ExecutionState::Success));
    }

    #[test]
    fn cron_state_ordering() {
        assert!(CronState::Active > CronState::Disabled);
        assert!(CronState::Disabled > CronState::Removed);
    }

    #[test]
    fn target_selector() {
        let selector = TargetSelector::Hosts(vec!["a".to_owned(), "b".to_owned()]);
        assert!(selector.matches("a"));
        assert!(!selector.matches("c"));
        assert!(TargetSelector::All.matches("c"));
    }

    #[test]
    fn definition_from_toml() {
        let definition: TaskDefinition = toml::from_str(
            r#"
            task_class = "report"
            delay_mode = "emulated"
            log_verbosity = "all"

            [rate_limit]
            dimension = "local_task_tag"
            limit = 5
            window_secs = 1

            [retry]
            auto_retry = true
            partner_threshold = 4
            "#,
        )
        .unwrap();

        assert_eq!(definition.delay_mode, DelayMode::Emulated);
        assert_eq!(
            definition.rate_limit.dimension,
            RateLimitDimension::LocalTaskTag
        );
        assert_eq!(definition.rate_limit.permits, 1);
        assert_eq!(definition.retry.overload_threshold, 3);
        assert_eq!(definition.retry.partner_threshold, 4);
    }
}
