//! A rate limited task runner and leader gated cron scheduler.
//!
//! Taskhive runs two kinds of work on a cluster of identical instances:
//!
//! - ad hoc tasks, delivered by a queue transport, an RPC call or a local call, which are run by
//!   the [`runner::TaskRunner`], and
//! - recurring tasks fired on cron schedules by the [`croner::TaskCroner`].
//!
//! Task bodies implement [`executor::Executor`] and are registered in an
//! [`executor::ExecutorRegistry`]. Per task class policy, such as rate limits, retry thresholds
//! and delay emulation, lives in a [`task::TaskDefinition`] resolved through a
//! [`config::ConfigProvider`] on every call.
//!
//! Every attempt ends in exactly one [`task::ExecutionState`]. Failures are classified into four
//! kinds that drive retries:
//!
//! - `fail_config`: admission was denied by a rate limiter; retried with linear backoff.
//! - `fail_partner`: a dependency of the task failed; retried with linear backoff.
//! - `fail_data`: the input is invalid; never retried.
//! - `fail_program`: anything else, including panics and timeouts; never retried.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use taskhive::prelude::*;
//!
//! struct Greet;
//!
//! #[async_trait::async_trait]
//! impl Executor for Greet {
//!     type Data = String;
//!     const NAME: &'static str = "greet";
//!
//!     async fn execute(&self, task: Task<Self::Data>) -> ExecutionResult {
//!         ExecutionResult::Output {
//!             result: format!("hello {}", task.data).into(),
//!         }
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let hive = Taskhive::builder(
//!     ExecutorRegistry::new().with_executor(Greet),
//!     Arc::new(DefinitionRegistry::default()),
//!     Arc::new(InMemoryQueue::new()),
//! )
//! .build();
//!
//! let done = hive
//!     .process_runner_invocation(TaskInvocation::new("greet", RunMode::Local, "world".into()))
//!     .await
//!     .unwrap();
//! assert_eq!(done.result, Some("hello world".into()));
//! # hive.graceful_shutdown().await.unwrap();
//! # }
//! ```
use std::{sync::Arc, time::Duration};

pub mod backoff;
pub mod config;
pub mod croner;
pub mod executor;
pub mod leader;
pub mod overflow;
pub mod prelude;
pub mod queue;
pub mod rate_limit;
pub mod runner;
pub mod settings;
pub mod sink;
pub mod task;
pub mod testing;

use config::{ConfigError, ConfigProvider};
use croner::{CronError, TaskCroner};
use executor::ExecutorRegistry;
use leader::{LeaderLock, SoleLeader};
use overflow::{OverflowExecutor, Submission};
use queue::{QueueError, QueueTransport};
use rate_limit::{GlobalRateLimiter, LocalRateLimiter};
use runner::TaskRunner;
use settings::Settings;
use sink::{LogSink, StatsSink, TracingSink};
use task::{CronDefinition, TaskInvocation};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CONSUMER_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// The embedding application's entry point, tying the runner, croner and overflow pool together.
pub struct Taskhive {
    settings: Settings,
    config: Arc<dyn ConfigProvider>,
    queue: Arc<dyn QueueTransport>,
    runner: TaskRunner,
    croner: TaskCroner,
    overflow: Arc<OverflowExecutor>,
    consumers: Vec<ConsumerHandle>,
}

impl std::fmt::Debug for Taskhive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Taskhive")
            .field("settings", &self.settings)
            .field("consumers", &self.consumers.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct ConsumerHandle {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    async fn graceful_shutdown(&mut self) -> Result<(), TaskhiveError> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|_| TaskhiveError::GracefulShutdownFailed)?;
        }
        Ok(())
    }
}

/// Collects the collaborators of a [`Taskhive`].
pub struct TaskhiveBuilder {
    settings: Settings,
    executors: ExecutorRegistry,
    config: Arc<dyn ConfigProvider>,
    queue: Arc<dyn QueueTransport>,
    leader: Arc<dyn LeaderLock>,
    local: Option<Arc<dyn LocalRateLimiter>>,
    global: Option<Arc<dyn GlobalRateLimiter>>,
    log_sink: Arc<dyn LogSink>,
    stats_sink: Arc<dyn StatsSink>,
}

impl std::fmt::Debug for TaskhiveBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskhiveBuilder")
            .field("settings", &self.settings)
            .field("executors", &self.executors)
            .finish_non_exhaustive()
    }
}

impl TaskhiveBuilder {
    pub fn with_settings(self, settings: Settings) -> Self {
        Self { settings, ..self }
    }

    /// Required for singleton cron jobs when running more than one instance.
    pub fn with_leader_lock(self, leader: Arc<dyn LeaderLock>) -> Self {
        Self { leader, ..self }
    }

    pub fn with_local_rate_limiter(self, local: Arc<dyn LocalRateLimiter>) -> Self {
        Self {
            local: Some(local),
            ..self
        }
    }

    /// Required by task definitions using a global rate limit dimension.
    pub fn with_global_rate_limiter(self, global: Arc<dyn GlobalRateLimiter>) -> Self {
        Self {
            global: Some(global),
            ..self
        }
    }

    pub fn with_log_sink(self, log_sink: Arc<dyn LogSink>) -> Self {
        Self { log_sink, ..self }
    }

    pub fn with_stats_sink(self, stats_sink: Arc<dyn StatsSink>) -> Self {
        Self { stats_sink, ..self }
    }

    /// Builds the containers and spawns the overflow workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Taskhive {
        let Self {
            settings,
            executors,
            config,
            queue,
            leader,
            local,
            global,
            log_sink,
            stats_sink,
        } = self;

        let mut runner = TaskRunner::new(
            settings.host_id.clone(),
            executors.clone(),
            config.clone(),
        )
        .with_settings(&settings.runner)
            .with_queue(queue.clone())
            .with_log_sink(log_sink.clone())
            .with_stats_sink(stats_sink.clone());
        if let Some(local) = local {
            runner = runner.with_local_rate_limiter(local);
        }
        if let Some(global) = global {
            runner = runner.with_global_rate_limiter(global);
        }

        let croner = TaskCroner::new(settings.host_id.clone(), executors)
            .with_settings(&settings.croner)
            .with_leader_lock(leader)
            .with_log_sink(log_sink)
            .with_stats_sink(stats_sink);

        let overflow = Arc::new(OverflowExecutor::new(
            runner.clone(),
            queue.clone(),
            &settings.overflow,
        ));

        tracing::info!(host_id = %settings.host_id, "Taskhive started");
        Taskhive {
            settings,
            config,
            queue,
            runner,
            croner,
            overflow,
            consumers: Vec::new(),
        }
    }
}

impl Taskhive {
    pub fn builder(
        executors: ExecutorRegistry,
        config: Arc<dyn ConfigProvider>,
        queue: Arc<dyn QueueTransport>,
    ) -> TaskhiveBuilder {
        TaskhiveBuilder {
            settings: Settings::default(),
            executors,
            config,
            queue,
            leader: Arc::new(SoleLeader),
            local: None,
            global: None,
            log_sink: Arc::new(TracingSink),
            stats_sink: Arc::new(TracingSink),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn croner(&self) -> &TaskCroner {
        &self.croner
    }

    /// Spawns a loop feeding queue deliveries into the local pool.
    ///
    /// The loop only receives once the pool has capacity, so a saturated instance leaves work on
    /// the queue for other instances.
    pub fn with_queue_consumer(mut self) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            let queue = self.queue.clone();
            let overflow = self.overflow.clone();
            async move {
                loop {
                    let received = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        received = queue.receive() => received,
                    };
                    match received {
                        Ok(invocation) => {
                            let task_id = invocation.id;
                            let _ = overflow.enqueue(invocation).await.inspect_err(|error| {
                                tracing::error!(
                                    ?error,
                                    %task_id,
                                    "Failed to dispatch task {task_id}: {error}"
                                )
                            });
                        }
                        Err(QueueError::Closed) => {
                            tracing::info!("Queue closed");
                            break;
                        }
                        Err(error) => {
                            tracing::error!(?error, "Failed to receive from queue: {error}");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(CONSUMER_ERROR_BACKOFF) => {},
                            }
                        }
                    }
                }
                tracing::debug!("Shutting down queue consumer");
            }
        });
        self.consumers.push(ConsumerHandle {
            cancel,
            handle: Some(handle),
        });
        self
    }

    pub fn configure_cron(&self, definition: CronDefinition) -> Result<bool, TaskhiveError> {
        Ok(self.croner.configure(definition)?)
    }

    /// Fetches the job's current definition from the config provider and applies it.
    pub async fn reload_cron(&self, job_id: &str) -> Result<bool, TaskhiveError> {
        let definition = self.config.croner_definition(job_id).await?;
        self.configure_cron(CronDefinition::clone(&definition))
    }

    pub fn stop_cron(&self, job_id: &str) -> bool {
        self.croner.stop_task(job_id)
    }

    pub async fn stop_all_crons(&self) {
        self.croner.stop_all().await
    }

    /// Runs an invocation delivered by RPC or any other caller awaiting its outcome.
    ///
    /// Returns [`None`] when the invocation was resubmitted to the queue.
    pub async fn process_runner_invocation(
        &self,
        invocation: TaskInvocation,
    ) -> Option<TaskInvocation> {
        self.runner.process(invocation).await
    }

    /// Runs an invocation on the local pool without waiting for it, diverting it to the queue
    /// when the pool is saturated.
    pub async fn submit_local(
        &self,
        invocation: TaskInvocation,
    ) -> Result<Submission, TaskhiveError> {
        Ok(self.overflow.submit(invocation).await?)
    }

    /// Stops the queue consumers and all crons, then drains the local pool.
    ///
    /// Executing ticks and invocations are allowed to finish.
    pub async fn graceful_shutdown(mut self) -> Result<(), TaskhiveError> {
        tracing::debug!("Shutting down Taskhive");
        let consumers = futures::future::join_all(
            self.consumers
                .iter_mut()
                .map(ConsumerHandle::graceful_shutdown),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>();
        self.croner.stop_all().await;
        self.overflow.shutdown().await;
        consumers.map(|_| ())
    }
}

#[derive(Debug, Error)]
pub enum TaskhiveError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Error configuring cron job")]
    Cron(#[from] CronError),
    #[error("Error resolving configuration")]
    Config(#[from] ConfigError),
    #[error("Error communicating with the queue")]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::{
        config::{DefinitionRegistry, Definitions},
        executor::Executor,
        queue::InMemoryQueue,
        task::{ExecutionState, RunMode, RunType},
        testing::{RecordingSink, Script, ScriptedExecutor},
    };

    struct Fixture {
        hive: Taskhive,
        executor: ScriptedExecutor,
        queue: InMemoryQueue,
        registry: DefinitionRegistry,
        sink: RecordingSink,
    }

    fn fixture() -> Fixture {
        let executor = ScriptedExecutor::default();
        let queue = InMemoryQueue::new();
        let registry = DefinitionRegistry::default();
        let sink = RecordingSink::default();
        let hive = Taskhive::builder(
            ExecutorRegistry::new().with_executor(executor.clone()),
            Arc::new(registry.clone()),
            Arc::new(queue.clone()),
        )
        .with_settings(Settings::from_toml_str("host_id = \"host-a\"").unwrap())
        .with_log_sink(Arc::new(sink.clone()))
        .with_stats_sink(Arc::new(sink.clone()))
        .build();
        Fixture {
            hive,
            executor,
            queue,
            registry,
            sink,
        }
    }

    fn invocation(run_mode: RunMode, script: Script) -> TaskInvocation {
        TaskInvocation::new(
            ScriptedExecutor::NAME,
            run_mode,
            serde_json::to_value(script).unwrap(),
        )
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn processes_rpc_invocation() {
        let Fixture { hive, .. } = fixture();

        let done = hive
            .process_runner_invocation(invocation(RunMode::Rpc, Script::Output(json!(7))))
            .await
            .unwrap();

        assert_eq!(done.state, ExecutionState::Success);
        assert_eq!(done.result, Some(json!(7)));
        hive.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn queue_consumer_runs_deliveries() {
        let Fixture {
            hive,
            executor,
            queue,
            sink,
            ..
        } = fixture();
        let hive = hive.with_queue_consumer();

        for _ in 0..3 {
            queue
                .send(invocation(RunMode::Queue, Script::Done), Duration::ZERO)
                .await
                .unwrap();
        }
        wait_for(|| sink.runner_stats().len() == 3).await;
        hive.graceful_shutdown().await.unwrap();

        assert_eq!(executor.executions(), 3);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn submit_local_runs_in_background() {
        let Fixture { hive, executor, .. } = fixture();

        let submission = hive
            .submit_local(invocation(RunMode::Local, Script::Done))
            .await
            .unwrap();
        hive.graceful_shutdown().await.unwrap();

        assert_eq!(submission, Submission::Local);
        assert_eq!(executor.executions(), 1);
    }

    #[tokio::test]
    async fn cron_lifecycle() {
        let Fixture {
            hive,
            registry,
            sink,
            ..
        } = fixture();
        registry.replace_all(Definitions::new(
            [],
            [CronDefinition::new("nightly", ScriptedExecutor::NAME, "* * * * * *")
                .with_run_type(RunType::Replicated)
                .with_payload(serde_json::to_value(Script::Done).unwrap())],
        ));

        assert!(hive.reload_cron("nightly").await.unwrap());
        assert!(hive.croner().is_scheduled("nightly"));
        wait_for(|| !sink.croner_stats().is_empty()).await;
        assert!(hive.stop_cron("nightly"));
        assert!(!hive.stop_cron("nightly"));

        assert_matches!(
            hive.reload_cron("missing").await,
            Err(TaskhiveError::Config(ConfigError::UnknownCronJob(_)))
        );
        hive.stop_all_crons().await;
        assert_matches!(
            hive.configure_cron(CronDefinition::new(
                "late",
                ScriptedExecutor::NAME,
                "* * * * * *"
            )),
            Err(TaskhiveError::Cron(CronError::Scheduler(_)))
        );
        hive.graceful_shutdown().await.unwrap();
    }
}
