//! The ad hoc task container.
//!
//! Each call to [`TaskRunner::process`] walks one invocation through admission control, optional
//! delay emulation, execution and failure classification, emits its statistics and log record,
//! and finally decides whether it is resubmitted.
//!
//! Resubmission depends on how the invocation arrived:
//!
//! - RPC and local calls with automatic retry enabled are retried in place after a linear backoff
//!   of `ran_times × rpc_retry_base`, so the caller only sees the final attempt.
//! - Queue deliveries are handed back to the queue transport with a delay of
//!   `ran_times × queue_retry_base` and nothing is returned to the caller.
//!
//! Only `fail_config` and `fail_partner` are ever resubmitted, each within its own threshold.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tracing::instrument;

use crate::{
    backoff::{BackoffStrategy, Linear, Strategy},
    config::ConfigProvider,
    executor::ExecutorRegistry,
    queue::QueueTransport,
    rate_limit::{Admission, AdmissionControl, GlobalRateLimiter, LocalRateLimiter},
    settings::RunnerSettings,
    sink::{LogSink, RunnerLog, RunnerStats, StatsSink, TracingSink},
    task::{DelayMode, ExecutionState, TaskDefinition, TaskInvocation},
};

const DEFAULT_RPC_RETRY_BASE: Duration = Duration::from_secs(1);
const DEFAULT_QUEUE_RETRY_BASE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resubmission {
    Terminal,
    Local(Duration),
    Queue(Duration),
}

/// Runs invocations of registered task classes.
///
/// The runner owns no workers of its own; it runs on whichever task calls
/// [`TaskRunner::process`]. Cloning is cheap and clones share all collaborators.
#[derive(Clone)]
pub struct TaskRunner {
    host_id: String,
    executors: ExecutorRegistry,
    config: Arc<dyn ConfigProvider>,
    admission: AdmissionControl,
    queue: Option<Arc<dyn QueueTransport>>,
    log_sink: Arc<dyn LogSink>,
    stats_sink: Arc<dyn StatsSink>,
    rpc_backoff: BackoffStrategy<Linear>,
    queue_backoff: BackoffStrategy<Linear>,
}

impl TaskRunner {
    pub fn new(
        host_id: impl Into<String>,
        executors: ExecutorRegistry,
        config: Arc<dyn ConfigProvider>,
    ) -> Self {
        let host_id = host_id.into();
        Self {
            admission: AdmissionControl::new(host_id.clone()),
            host_id,
            executors,
            config,
            queue: None,
            log_sink: Arc::new(TracingSink),
            stats_sink: Arc::new(TracingSink),
            rpc_backoff: BackoffStrategy::linear(DEFAULT_RPC_RETRY_BASE),
            queue_backoff: BackoffStrategy::linear(DEFAULT_QUEUE_RETRY_BASE),
        }
    }

    pub fn with_settings(self, settings: &RunnerSettings) -> Self {
        Self {
            rpc_backoff: BackoffStrategy::linear(settings.rpc_retry_base()),
            queue_backoff: BackoffStrategy::linear(settings.queue_retry_base()),
            ..self
        }
    }

    pub fn with_local_rate_limiter(self, local: Arc<dyn LocalRateLimiter>) -> Self {
        Self {
            admission: self.admission.with_local(local),
            ..self
        }
    }

    pub fn with_global_rate_limiter(self, global: Arc<dyn GlobalRateLimiter>) -> Self {
        Self {
            admission: self.admission.with_global(global),
            ..self
        }
    }

    /// The transport queue deliveries are resubmitted to.
    pub fn with_queue(self, queue: Arc<dyn QueueTransport>) -> Self {
        Self {
            queue: Some(queue),
            ..self
        }
    }

    pub fn with_log_sink(self, log_sink: Arc<dyn LogSink>) -> Self {
        Self { log_sink, ..self }
    }

    pub fn with_stats_sink(self, stats_sink: Arc<dyn StatsSink>) -> Self {
        Self { stats_sink, ..self }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Processes `invocation` to completion.
    ///
    /// Returns the final attempt, or [`None`] when the invocation was handed back to the queue
    /// transport for another attempt.
    #[instrument(
        skip_all,
        fields(
            task_id = %invocation.id,
            task_class = %invocation.task_class,
            run_mode = ?invocation.run_mode,
        )
    )]
    pub async fn process(&self, invocation: TaskInvocation) -> Option<TaskInvocation> {
        let definition = self.definition(&invocation.task_class).await;
        let mut invocation = invocation;
        loop {
            self.attempt(&definition, &mut invocation).await;
            self.record(&definition, &invocation);

            match self.resubmission(&definition, &invocation) {
                Resubmission::Terminal => return Some(invocation),
                Resubmission::Local(delay) => {
                    tracing::warn!(
                        attempt = invocation.ran_times,
                        state = %invocation.state,
                        "Task {} failed and will be retried in {delay:?}",
                        invocation.id,
                    );
                    tokio::time::sleep(delay).await;
                    invocation = invocation.next_attempt();
                }
                Resubmission::Queue(delay) => return self.requeue(invocation, delay).await,
            }
        }
    }

    async fn definition(&self, task_class: &str) -> Arc<TaskDefinition> {
        self.config
            .runner_definition(task_class)
            .await
            .unwrap_or_else(|error| {
                tracing::warn!(?error, %task_class, "Using default definition: {error}");
                Arc::new(TaskDefinition::new(task_class))
            })
    }

    /// Runs one physical attempt, leaving `invocation` in a terminal state.
    async fn attempt(&self, definition: &TaskDefinition, invocation: &mut TaskInvocation) {
        invocation.mark_consumed();

        if !invocation.run_mode.is_direct() && definition.rate_limit.dimension.is_enabled() {
            let admission = self
                .admission
                .admit(
                    &definition.rate_limit,
                    &invocation.task_class,
                    invocation.rate_limit_tag.as_deref(),
                )
                .await;
            if let Admission::Denied { tier, reason } = admission {
                tracing::warn!(%tier, attempt = invocation.ran_times, "{reason}");
                invocation.mark_finished(ExecutionState::FailConfig, None, Some(reason));
                return;
            }
        }

        if definition.delay_mode == DelayMode::Emulated {
            if let Some(remaining) = invocation.remaining_delay(Utc::now()) {
                tracing::debug!(?remaining, "Emulating delayed delivery");
                tokio::time::sleep(remaining).await;
            }
        }

        invocation.mark_started();
        tracing::debug!(attempt = invocation.ran_times, "Executing task {}", invocation.id);
        let outcome = self.executors.run(invocation, definition.timeout()).await;
        invocation.mark_finished(outcome.state, outcome.result, outcome.error);
    }

    fn record(&self, definition: &TaskDefinition, invocation: &TaskInvocation) {
        match invocation.state {
            ExecutionState::Success => {
                tracing::debug!(attempt = invocation.ran_times, "Task {} complete", invocation.id)
            }
            state => tracing::warn!(
                attempt = invocation.ran_times,
                %state,
                error = ?invocation.error,
                "Task {} failed",
                invocation.id,
            ),
        }

        let _ = self
            .stats_sink
            .update_runner_stats(&RunnerStats::from(invocation))
            .inspect_err(|error| {
                tracing::error!(?error, "Failed to update runner stats: {error}")
            });

        if definition.log_verbosity.admits(invocation.state) {
            let record = RunnerLog {
                host_id: self.host_id.clone(),
                invocation: invocation.clone(),
            };
            let _ = self
                .log_sink
                .send_runner_log(&record)
                .inspect_err(|error| {
                    tracing::error!(?error, "Failed to send runner log: {error}")
                });
        }
    }

    fn resubmission(
        &self,
        definition: &TaskDefinition,
        invocation: &TaskInvocation,
    ) -> Resubmission {
        let retry = definition.retry;
        if !retry.allows(invocation.state, invocation.ran_times) {
            return Resubmission::Terminal;
        }
        if !invocation.run_mode.is_direct() {
            Resubmission::Queue(self.queue_backoff.backoff(invocation.ran_times))
        } else if retry.auto_retry {
            Resubmission::Local(self.rpc_backoff.backoff(invocation.ran_times))
        } else {
            Resubmission::Terminal
        }
    }

    async fn requeue(&self, invocation: TaskInvocation, delay: Duration) -> Option<TaskInvocation> {
        let Some(queue) = &self.queue else {
            tracing::error!(
                "No queue transport configured, task {} will not be retried",
                invocation.id
            );
            return Some(invocation);
        };
        let next = invocation.next_attempt().with_delay(delay);
        match queue.send(next, delay).await {
            Ok(()) => {
                tracing::warn!(
                    attempt = invocation.ran_times,
                    state = %invocation.state,
                    "Task {} failed and was resubmitted to the queue with delay {delay:?}",
                    invocation.id,
                );
                None
            }
            Err(error) => {
                tracing::error!(?error, "Failed to resubmit task {}: {error}", invocation.id);
                Some(invocation)
            }
        }
    }
}
