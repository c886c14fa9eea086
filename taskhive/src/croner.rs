//! The recurring task container.
//!
//! Every configured job gets its own scheduling loop that sleeps until the next fire time of its
//! cron expression, runs the tick and then re-arms itself from the tick's scheduled instant. The
//! schedule is never leader gated, only execution is: a singleton job's tick is silently skipped
//! on every instance not holding the [`LeaderLock`], which keeps all instances on the same
//! schedule regardless of who executes.
//!
//! Ticks of one job are strictly sequential. Ticks of different jobs run concurrently, bounded by
//! the croner's pool size.
use std::{
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::join_all;
use fxhash::FxHashMap;
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    executor::{ExecutorRegistry, Outcome},
    leader::{LeaderLock, LeaderLockExt, SoleLeader},
    settings::CronerSettings,
    sink::{CronerLog, CronerStats, LogSink, StatsSink, TracingSink},
    task::{CronDefinition, CronState, RunMode, RunType, TaskId, TaskInvocation},
};

const DEFAULT_POOL_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("Invalid schedule {schedule:?} for cron job {job_id}")]
    InvalidSchedule {
        job_id: String,
        schedule: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("Invalid cron job definition: {0}")]
    InvalidDefinition(String),
    #[error("Cron scheduler error: {0}")]
    Scheduler(String),
}

/// The live state of one configured job.
struct CronEntry {
    definition: Arc<CronDefinition>,
    next_fire: Arc<Mutex<Option<DateTime<Utc>>>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// What happened during one executed tick.
///
/// Created when the tick fires and consumed by [`Job::complete`], never outliving the tick.
struct TickContext {
    task_id: TaskId,
    scheduled_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    outcome: Outcome,
}

/// Schedules cron jobs on this instance.
///
/// Cloning is cheap; clones share the same jobs. Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct TaskCroner {
    host_id: String,
    executors: ExecutorRegistry,
    leader: Arc<dyn LeaderLock>,
    log_sink: Arc<dyn LogSink>,
    stats_sink: Arc<dyn StatsSink>,
    pool_size: usize,
    pool: Arc<Semaphore>,
    entries: Arc<Mutex<FxHashMap<String, CronEntry>>>,
    /// Loops of stopped or replaced jobs that may still be finishing a tick.
    retired: Arc<Mutex<Vec<JoinHandle<()>>>>,
    cancel: CancellationToken,
}

impl TaskCroner {
    pub fn new(host_id: impl Into<String>, executors: ExecutorRegistry) -> Self {
        Self {
            host_id: host_id.into(),
            executors,
            leader: Arc::new(SoleLeader),
            log_sink: Arc::new(TracingSink),
            stats_sink: Arc::new(TracingSink),
            pool_size: DEFAULT_POOL_SIZE,
            pool: Arc::new(Semaphore::new(DEFAULT_POOL_SIZE)),
            entries: Default::default(),
            retired: Default::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_settings(self, settings: &CronerSettings) -> Self {
        self.with_pool_size(settings.effective_pool_size())
    }

    /// The number of ticks, across all jobs, that may execute at the same time.
    pub fn with_pool_size(self, pool_size: usize) -> Self {
        Self {
            pool_size,
            pool: Arc::new(Semaphore::new(pool_size)),
            ..self
        }
    }

    pub fn with_leader_lock(self, leader: Arc<dyn LeaderLock>) -> Self {
        Self { leader, ..self }
    }

    pub fn with_log_sink(self, log_sink: Arc<dyn LogSink>) -> Self {
        Self { log_sink, ..self }
    }

    pub fn with_stats_sink(self, stats_sink: Arc<dyn StatsSink>) -> Self {
        Self { stats_sink, ..self }
    }

    /// Schedules `definition`, replacing any live entry for the same job.
    ///
    /// Returns `false` without scheduling anything when the job is not active or not targeted at
    /// this host; a live entry for the job is stopped in that case.
    pub fn configure(&self, definition: CronDefinition) -> Result<bool, CronError> {
        if self.cancel.is_cancelled() {
            return Err(CronError::Scheduler("croner has been stopped".to_owned()));
        }
        if self.pool_size == 0 {
            return Err(CronError::Scheduler("pool size must be positive".to_owned()));
        }
        if definition.job_id.is_empty() {
            return Err(CronError::InvalidDefinition("job id is empty".to_owned()));
        }
        if definition.task_class.is_empty() {
            return Err(CronError::InvalidDefinition(format!(
                "task class of job {} is empty",
                definition.job_id
            )));
        }
        let schedule =
            Schedule::from_str(&definition.schedule).map_err(|source| CronError::InvalidSchedule {
                job_id: definition.job_id.clone(),
                schedule: definition.schedule.clone(),
                source,
            })?;

        let job_id = definition.job_id.clone();
        if definition.state < CronState::Active || !definition.target.matches(&self.host_id) {
            tracing::info!(
                %job_id,
                state = ?definition.state,
                "Cron job {job_id} is not active on {}",
                self.host_id
            );
            self.stop_task(&job_id);
            return Ok(false);
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = entries.remove(&job_id) {
            tracing::debug!(%job_id, "Replacing schedule for cron job {job_id}");
            self.retire(previous);
        }

        let definition = Arc::new(definition);
        let next_fire = Arc::new(Mutex::new(None));
        let cancel = self.cancel.child_token();
        let job = Job {
            host_id: self.host_id.clone(),
            definition: definition.clone(),
            schedule,
            executors: self.executors.clone(),
            leader: self.leader.clone(),
            log_sink: self.log_sink.clone(),
            stats_sink: self.stats_sink.clone(),
            pool: self.pool.clone(),
            next_fire: next_fire.clone(),
        };
        let handle = tokio::spawn(
            job.run(cancel.clone())
                .instrument(tracing::info_span!("cron_job", %job_id)),
        );
        entries.insert(
            job_id,
            CronEntry {
                definition,
                next_fire,
                cancel,
                handle,
            },
        );
        Ok(true)
    }

    /// Cancels the job's schedule, returning whether it was scheduled.
    ///
    /// A tick already executing is allowed to finish.
    pub fn stop_task(&self, job_id: &str) -> bool {
        let entry = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
        match entry {
            Some(entry) => {
                tracing::info!(%job_id, "Stopping cron job {job_id}");
                self.retire(entry);
                true
            }
            None => false,
        }
    }

    fn retire(&self, entry: CronEntry) {
        entry.cancel.cancel();
        let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
        retired.retain(|handle| !handle.is_finished());
        retired.push(entry.handle);
    }

    /// Cancels every job and shuts the scheduler down, waiting for executing ticks to finish.
    ///
    /// No jobs can be configured afterwards.
    pub async fn stop_all(&self) {
        self.cancel.cancel();
        let mut handles = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry.handle)
            .collect::<Vec<_>>();
        tracing::info!("Stopping {} cron jobs", handles.len());
        handles.append(&mut self.retired.lock().unwrap_or_else(PoisonError::into_inner));
        for result in join_all(handles).await {
            let _ = result.inspect_err(|error| {
                tracing::error!(?error, "Cron job did not shut down cleanly: {error}")
            });
        }
    }

    pub fn is_scheduled(&self, job_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(job_id)
    }

    /// The instant the job will next fire, once its loop has armed.
    pub fn next_fire_time(&self, job_id: &str) -> Option<DateTime<Utc>> {
        let next_fire = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)?
            .next_fire
            .clone();
        let next = *next_fire.lock().unwrap_or_else(PoisonError::into_inner);
        next
    }

    pub fn definition(&self, job_id: &str) -> Option<Arc<CronDefinition>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .map(|entry| entry.definition.clone())
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// The scheduling loop of one job.
struct Job {
    host_id: String,
    definition: Arc<CronDefinition>,
    schedule: Schedule,
    executors: ExecutorRegistry,
    leader: Arc<dyn LeaderLock>,
    log_sink: Arc<dyn LogSink>,
    stats_sink: Arc<dyn StatsSink>,
    pool: Arc<Semaphore>,
    next_fire: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl Job {
    async fn run(self, cancel: CancellationToken) {
        let mut next = self.schedule.after(&Utc::now()).next();
        loop {
            self.set_next_fire(next);
            let Some(scheduled_at) = next else {
                tracing::warn!("Cron schedule has no upcoming fire time");
                break;
            };

            tokio::select! {
                _ = sleep_until(scheduled_at) => {},
                _ = cancel.cancelled() => break,
            }
            let permit = tokio::select! {
                permit = self.pool.acquire() => permit,
                _ = cancel.cancelled() => break,
            };
            let Ok(_permit) = permit else {
                tracing::error!("Cron pool closed");
                break;
            };

            next = match self.tick(scheduled_at).await {
                Some(context) => self.complete(context),
                None => self.next_after(scheduled_at),
            };
        }
        tracing::debug!("Shutting down cron scheduler");
    }

    fn set_next_fire(&self, next: Option<DateTime<Utc>>) {
        *self.next_fire.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// The first fire time after `scheduled_at` that is still in the future.
    ///
    /// Ticks missed while a slow tick was executing are skipped rather than fired back to back.
    fn next_after(&self, scheduled_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        self.schedule
            .after(&scheduled_at)
            .find(|next| *next > now)
    }

    /// Executes the job body, or returns [`None`] when a singleton tick is skipped.
    async fn tick(&self, scheduled_at: DateTime<Utc>) -> Option<TickContext> {
        let definition = &self.definition;
        if definition.run_type == RunType::Singleton && !self.leader.is_lock().await {
            tracing::trace!(%scheduled_at, "Not the leader, skipping singleton tick");
            return None;
        }

        let mut invocation = TaskInvocation::new(
            definition.task_class.clone(),
            RunMode::Local,
            definition.payload.clone(),
        );
        invocation.mark_consumed();
        let started_at = Utc::now();
        tracing::debug!(%scheduled_at, task_id = %invocation.id, "Executing cron tick");
        let outcome = self.executors.run(&invocation, definition.timeout()).await;
        Some(TickContext {
            task_id: invocation.id,
            scheduled_at,
            started_at,
            finished_at: Utc::now().max(started_at),
            outcome,
        })
    }

    /// Computes the next fire time and ships the tick's statistics and log record.
    fn complete(&self, context: TickContext) -> Option<DateTime<Utc>> {
        let next = self.next_after(context.scheduled_at);
        let definition = &self.definition;
        let record = CronerLog {
            host_id: self.host_id.clone(),
            job_id: definition.job_id.clone(),
            task_id: context.task_id,
            task_class: definition.task_class.clone(),
            scheduled_at: context.scheduled_at,
            started_at: context.started_at,
            finished_at: context.finished_at,
            next_fire_at: next,
            state: context.outcome.state,
            result: context.outcome.result,
            error: context.outcome.error,
        };

        if record.state.is_failure() {
            tracing::warn!(state = %record.state, error = ?record.error, "Cron tick failed");
        } else {
            tracing::debug!(next_fire_at = ?next, "Cron tick complete");
        }

        let _ = self
            .stats_sink
            .update_croner_stats(&CronerStats::from(&record))
            .inspect_err(|error| {
                tracing::error!(?error, "Failed to update croner stats: {error}")
            });
        if definition.log_verbosity.admits(record.state) {
            let _ = self
                .log_sink
                .send_croner_log(&definition.job_id, &record)
                .inspect_err(|error| {
                    tracing::error!(?error, "Failed to send croner log: {error}")
                });
        }
        next
    }
}

async fn sleep_until(at: DateTime<Utc>) {
    while let Ok(remaining) = (at - Utc::now()).to_std() {
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(remaining.max(Duration::from_millis(1))).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::{
        executor::Executor,
        leader::{InMemoryLeaderLock, LeaderError, MockLeaderLock},
        task::{ExecutionState, LogVerbosity, TargetSelector},
        testing::{RecordingSink, Script, ScriptedExecutor},
    };

    const EVERY_SECOND: &str = "* * * * * *";

    fn croner(host_id: &str, sink: &RecordingSink, executor: &ScriptedExecutor) -> TaskCroner {
        TaskCroner::new(
            host_id,
            ExecutorRegistry::new().with_executor(executor.clone()),
        )
        .with_log_sink(Arc::new(sink.clone()))
        .with_stats_sink(Arc::new(sink.clone()))
    }

    fn job(script: Script) -> CronDefinition {
        CronDefinition::new("job", ScriptedExecutor::NAME, EVERY_SECOND)
            .with_payload(serde_json::to_value(script).unwrap())
            .with_log_verbosity(LogVerbosity::All)
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
    async fn replicated_job_runs_and_reschedules() {
        let sink = RecordingSink::default();
        let executor = ScriptedExecutor::default();
        let croner = croner("host-a", &sink, &executor);

        assert!(croner
            .configure(job(Script::Output(json!(1))).with_run_type(RunType::Replicated))
            .unwrap());
        assert!(croner.is_scheduled("job"));
        wait_for(|| croner.next_fire_time("job").is_some()).await;
        wait_for(|| !sink.croner_logs().is_empty()).await;

        let logs = sink.croner_logs();
        let log = &logs[0];
        assert_eq!(log.job_id, "job");
        assert_eq!(log.host_id, "host-a");
        assert_eq!(log.state, ExecutionState::Success);
        assert_eq!(log.result, Some(json!(1)));
        assert!(log.started_at >= log.scheduled_at);
        assert!(log.finished_at >= log.started_at);
        assert_matches!(log.next_fire_at, Some(next) if next > log.scheduled_at);
        assert_eq!(sink.croner_stats()[0].job_id, "job");

        croner.stop_all().await;
    }

    #[tokio::test]
    async fn failing_tick_is_classified_and_not_retried() {
        let sink = RecordingSink::default();
        let executor = ScriptedExecutor::default();
        let croner = croner("host-a", &sink, &executor);

        croner
            .configure(job(Script::PartnerError).with_run_type(RunType::Replicated))
            .unwrap();
        wait_for(|| !sink.croner_logs().is_empty()).await;
        croner.stop_all().await;

        let logs = sink.croner_logs();
        assert_eq!(logs[0].state, ExecutionState::FailPartner);
        assert_eq!(sink.croner_stats()[0].partner_failures, 1);
        // One execution per tick.
        assert_eq!(executor.executions(), logs.len());
    }

    #[tokio::test]
    async fn singleton_runs_only_on_leader() {
        let leader_sink = RecordingSink::default();
        let follower_sink = RecordingSink::default();
        let executor = ScriptedExecutor::default();
        let lock = InMemoryLeaderLock::new("host-a", Duration::from_secs(30));
        assert!(lock.is_lock().await);
        let leader =
            croner("host-a", &leader_sink, &executor).with_leader_lock(Arc::new(lock.clone()));
        let follower = croner("host-b", &follower_sink, &executor)
            .with_leader_lock(Arc::new(lock.contender("host-b")));

        leader.configure(job(Script::Done)).unwrap();
        follower.configure(job(Script::Done)).unwrap();
        wait_for(|| !leader_sink.croner_logs().is_empty()).await;
        let next = leader_sink.croner_logs()[0].next_fire_at;
        wait_for(|| follower.next_fire_time("job") == next).await;

        assert!(follower_sink.croner_logs().is_empty());
        assert!(follower_sink.croner_stats().is_empty());
        assert!(follower.is_scheduled("job"));

        leader.stop_all().await;
        follower.stop_all().await;
    }

    #[tokio::test]
    async fn unreachable_leader_lock_skips_ticks() {
        let sink = RecordingSink::default();
        let executor = ScriptedExecutor::default();
        let mut lock = MockLeaderLock::new();
        lock.expect_try_is_leader()
            .returning(|| Err(LeaderError::Unavailable("connection refused".to_owned())));
        let croner = croner("host-a", &sink, &executor).with_leader_lock(Arc::new(lock));

        croner.configure(job(Script::Done)).unwrap();
        let first = {
            wait_for(|| croner.next_fire_time("job").is_some()).await;
            croner.next_fire_time("job")
        };
        wait_for(|| croner.next_fire_time("job") != first).await;
        croner.stop_all().await;

        assert_eq!(executor.executions(), 0);
        assert!(sink.croner_logs().is_empty());
    }

    #[tokio::test]
    async fn stop_task_cancels_schedule() {
        let sink = RecordingSink::default();
        let executor = ScriptedExecutor::default();
        let croner = croner("host-a", &sink, &executor);
        croner
            .configure(job(Script::Done).with_run_type(RunType::Replicated))
            .unwrap();

        assert!(croner.stop_task("job"));
        assert!(!croner.stop_task("job"));
        assert!(!croner.is_scheduled("job"));
        assert_eq!(croner.next_fire_time("job"), None);

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(executor.executions(), 0);
    }

    #[tokio::test]
    async fn reconfigure_replaces_entry() {
        let sink = RecordingSink::default();
        let executor = ScriptedExecutor::default();
        let croner = croner("host-a", &sink, &executor);
        croner
            .configure(job(Script::Done).with_run_type(RunType::Replicated))
            .unwrap();

        croner
            .configure(CronDefinition {
                schedule: "*/2 * * * * *".to_owned(),
                ..job(Script::DataError).with_run_type(RunType::Replicated)
            })
            .unwrap();
        wait_for(|| !sink.croner_logs().is_empty()).await;
        croner.stop_all().await;

        assert_eq!(croner.job_ids().len(), 0);
        assert!(sink
            .croner_logs()
            .iter()
            .all(|log| log.state == ExecutionState::FailData));
    }

    #[tokio::test]
    async fn inactive_or_untargeted_jobs_are_not_scheduled() {
        let sink = RecordingSink::default();
        let executor = ScriptedExecutor::default();
        let croner = croner("host-a", &sink, &executor);
        croner.configure(job(Script::Done)).unwrap();

        assert!(!croner
            .configure(job(Script::Done).with_state(CronState::Disabled))
            .unwrap());
        assert!(!croner.is_scheduled("job"));

        assert!(!croner
            .configure(
                job(Script::Done).with_target(TargetSelector::Hosts(vec!["host-b".to_owned()]))
            )
            .unwrap());
        assert!(!croner.is_scheduled("job"));

        assert!(croner
            .configure(
                job(Script::Done).with_target(TargetSelector::Hosts(vec!["host-a".to_owned()]))
            )
            .unwrap());
        assert!(croner.is_scheduled("job"));
        croner.stop_all().await;
    }

    #[tokio::test]
    async fn invalid_definitions_are_rejected() {
        let croner = TaskCroner::new("host-a", ExecutorRegistry::new());

        assert_matches!(
            croner.configure(CronDefinition::new("job", "report", "every tuesday")),
            Err(CronError::InvalidSchedule { job_id, .. }) if job_id == "job"
        );
        assert_matches!(
            croner.configure(CronDefinition::new("", "report", EVERY_SECOND)),
            Err(CronError::InvalidDefinition(_))
        );
        assert_matches!(
            croner
                .clone()
                .with_pool_size(0)
                .configure(CronDefinition::new("job", "report", EVERY_SECOND)),
            Err(CronError::Scheduler(_))
        );
        assert!(croner.job_ids().is_empty());
    }

    #[tokio::test]
    async fn stopped_croner_rejects_jobs() {
        let croner = TaskCroner::new("host-a", ExecutorRegistry::new());
        croner.stop_all().await;

        assert_matches!(
            croner.configure(CronDefinition::new("job", "report", EVERY_SECOND)),
            Err(CronError::Scheduler(_))
        );
    }

    #[tokio::test]
    async fn stop_all_waits_for_executing_tick() {
        let sink = RecordingSink::default();
        let executor = ScriptedExecutor::default();
        let croner = croner("host-a", &sink, &executor);
        croner
            .configure(job(Script::Sleep { millis: 300 }).with_run_type(RunType::Replicated))
            .unwrap();
        wait_for(|| executor.executions() > 0).await;

        croner.stop_all().await;

        assert_eq!(sink.croner_logs().len(), executor.executions());
        assert!(!croner.is_scheduled("job"));
    }

    #[tokio::test]
    async fn stop_all_waits_for_ticks_of_replaced_jobs() {
        let sink = RecordingSink::default();
        let executor = ScriptedExecutor::default();
        let croner = croner("host-a", &sink, &executor);
        croner
            .configure(job(Script::Sleep { millis: 800 }).with_run_type(RunType::Replicated))
            .unwrap();
        wait_for(|| executor.executions() > 0).await;

        croner
            .configure(CronDefinition {
                schedule: "0 0 0 1 1 *".to_owned(),
                ..job(Script::Done).with_run_type(RunType::Replicated)
            })
            .unwrap();
        croner.stop_all().await;

        assert_eq!(executor.executions(), 1);
        assert_eq!(sink.croner_logs().len(), 1);
    }

    #[tokio::test]
    async fn stop_all_waits_for_ticks_of_stopped_jobs() {
        let sink = RecordingSink::default();
        let executor = ScriptedExecutor::default();
        let croner = croner("host-a", &sink, &executor);
        croner
            .configure(job(Script::Sleep { millis: 800 }).with_run_type(RunType::Replicated))
            .unwrap();
        wait_for(|| executor.executions() > 0).await;

        assert!(croner.stop_task("job"));
        croner.stop_all().await;

        assert_eq!(executor.executions(), 1);
        assert_eq!(sink.croner_logs().len(), 1);
    }

    #[tokio::test]
    async fn ticks_run_as_first_attempt() {
        let sink = RecordingSink::default();
        let executor = ScriptedExecutor::default();
        let croner = croner("host-a", &sink, &executor);

        croner
            .configure(job(Script::EchoAttempt).with_run_type(RunType::Replicated))
            .unwrap();
        wait_for(|| !sink.croner_logs().is_empty()).await;
        croner.stop_all().await;

        assert!(sink
            .croner_logs()
            .iter()
            .all(|log| log.result == Some(json!(1))));
    }
}
