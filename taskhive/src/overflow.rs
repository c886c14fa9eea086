//! A bounded local worker pool that overflows onto the queue.
//!
//! Invocations submitted locally skip the round trip through the queue transport and run on one
//! of a fixed number of workers. Once every worker is busy and the backlog is full, further
//! submissions are sent to the queue transport instead, so local saturation shows up as queue
//! depth rather than a stalled caller or a lost task.
use std::{
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use futures::future::join_all;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

use crate::{
    queue::{QueueError, QueueTransport},
    runner::TaskRunner,
    settings::OverflowSettings,
    task::{RunMode, TaskInvocation},
};

/// Where a submitted invocation went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Accepted by the local pool.
    Local,
    /// The pool was saturated and the invocation was sent to the queue transport.
    Diverted,
}

pub struct OverflowExecutor {
    sender: RwLock<Option<mpsc::Sender<TaskInvocation>>>,
    queue: Arc<dyn QueueTransport>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl OverflowExecutor {
    /// Spawns the workers, each running invocations through `runner`.
    ///
    /// The pool always has at least one worker and a backlog of at least one invocation.
    pub fn new(
        runner: TaskRunner,
        queue: Arc<dyn QueueTransport>,
        settings: &OverflowSettings,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(settings.backlog.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let workers = (0..settings.workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let runner = runner.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(invocation) = next else {
                            break;
                        };
                        runner.process(invocation).await;
                    }
                    tracing::debug!(worker, "Overflow worker shutting down");
                })
            })
            .collect();

        Self {
            sender: RwLock::new(Some(sender)),
            queue,
            workers: Mutex::new(workers),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<TaskInvocation>> {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs `invocation` locally if there is capacity, otherwise sends it to the queue.
    ///
    /// Never waits for local capacity.
    pub async fn submit(&self, invocation: TaskInvocation) -> Result<Submission, QueueError> {
        let invocation = match self.sender() {
            Some(sender) => match sender.try_send(invocation) {
                Ok(()) => return Ok(Submission::Local),
                Err(TrySendError::Full(invocation)) => {
                    tracing::warn!(
                        task_id = %invocation.id,
                        task_class = %invocation.task_class,
                        "Local pool saturated, diverting task {} to the queue",
                        invocation.id
                    );
                    invocation
                }
                Err(TrySendError::Closed(invocation)) => invocation,
            },
            None => invocation,
        };
        self.divert(invocation).await
    }

    /// Runs `invocation` locally, waiting for capacity.
    ///
    /// Only diverts to the queue once the pool has been shut down.
    pub async fn enqueue(&self, invocation: TaskInvocation) -> Result<Submission, QueueError> {
        let Some(sender) = self.sender() else {
            return self.divert(invocation).await;
        };
        match sender.send(invocation).await {
            Ok(()) => Ok(Submission::Local),
            Err(mpsc::error::SendError(invocation)) => self.divert(invocation).await,
        }
    }

    /// Sends `invocation` to the queue, where it is delivered like any other queued task.
    async fn divert(&self, mut invocation: TaskInvocation) -> Result<Submission, QueueError> {
        invocation.run_mode = RunMode::Queue;
        let task_id = invocation.id;
        self.queue
            .send(invocation, Duration::ZERO)
            .await
            .inspect_err(|error| {
                tracing::error!(?error, %task_id, "Failed to divert task {task_id}: {error}")
            })?;
        Ok(Submission::Diverted)
    }

    /// Stops accepting work and waits for the workers to drain the backlog.
    pub async fn shutdown(&self) {
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for result in join_all(workers).await {
            let _ = result.inspect_err(|error| {
                tracing::error!(?error, "Overflow worker did not shut down cleanly: {error}")
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        config::DefinitionRegistry,
        executor::{Executor, ExecutorRegistry},
        queue::{InMemoryQueue, MockQueueTransport},
        testing::{Script, ScriptedExecutor},
    };

    fn runner(executor: &ScriptedExecutor) -> TaskRunner {
        TaskRunner::new(
            "host-a",
            ExecutorRegistry::new().with_executor(executor.clone()),
            Arc::new(DefinitionRegistry::default()),
        )
    }

    fn invocation(script: Script) -> TaskInvocation {
        TaskInvocation::new(
            ScriptedExecutor::NAME,
            RunMode::Local,
            serde_json::to_value(script).unwrap(),
        )
    }

    async fn wait_for_executions(executor: &ScriptedExecutor, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while executor.executions() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("executions did not start in time");
    }

    #[tokio::test]
    async fn saturated_pool_diverts_to_queue() {
        let executor = ScriptedExecutor::default();
        let queue = InMemoryQueue::new();
        let pool = OverflowExecutor::new(
            runner(&executor),
            Arc::new(queue.clone()),
            &OverflowSettings {
                workers: 1,
                backlog: 1,
            },
        );

        let running = pool
            .submit(invocation(Script::Sleep { millis: 300 }))
            .await
            .unwrap();
        wait_for_executions(&executor, 1).await;
        let backlogged = pool.submit(invocation(Script::Done)).await.unwrap();
        let overflow = invocation(Script::Done).with_tag("partner-1");
        let diverted = pool.submit(overflow.clone()).await.unwrap();

        assert_eq!(running, Submission::Local);
        assert_eq!(backlogged, Submission::Local);
        assert_eq!(diverted, Submission::Diverted);
        assert_eq!(
            queue.pending(),
            vec![TaskInvocation {
                run_mode: RunMode::Queue,
                ..overflow
            }]
        );

        pool.shutdown().await;
        assert_eq!(executor.executions(), 2);
    }

    #[tokio::test]
    async fn shutdown_drains_backlog() {
        let executor = ScriptedExecutor::default();
        let queue = InMemoryQueue::new();
        let pool = OverflowExecutor::new(
            runner(&executor),
            Arc::new(queue.clone()),
            &OverflowSettings {
                workers: 1,
                backlog: 4,
            },
        );
        for _ in 0..3 {
            pool.submit(invocation(Script::Sleep { millis: 20 }))
                .await
                .unwrap();
        }

        pool.shutdown().await;

        assert_eq!(executor.executions(), 3);
        assert!(queue.is_empty());
        assert_eq!(
            pool.submit(invocation(Script::Done)).await.unwrap(),
            Submission::Diverted
        );
    }

    #[tokio::test]
    async fn enqueue_waits_for_capacity() {
        let executor = ScriptedExecutor::default();
        let queue = InMemoryQueue::new();
        let pool = OverflowExecutor::new(
            runner(&executor),
            Arc::new(queue.clone()),
            &OverflowSettings {
                workers: 1,
                backlog: 1,
            },
        );

        for _ in 0..4 {
            assert_eq!(
                pool.enqueue(invocation(Script::Sleep { millis: 10 }))
                    .await
                    .unwrap(),
                Submission::Local
            );
        }
        pool.shutdown().await;

        assert_eq!(executor.executions(), 4);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn divert_failure_is_reported() {
        let executor = ScriptedExecutor::default();
        let mut queue = MockQueueTransport::new();
        queue
            .expect_send()
            .times(1)
            .returning(|_, _| Err(QueueError::Transport("broker down".to_owned())));
        let pool = OverflowExecutor::new(
            runner(&executor),
            Arc::new(queue),
            &OverflowSettings::default(),
        );
        pool.shutdown().await;

        assert_matches!(
            pool.submit(invocation(Script::Done)).await,
            Err(QueueError::Transport(_))
        );
    }
}
