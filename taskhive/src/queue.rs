//! The queue transport that delivers invocations to the runner.
//!
//! Only the contract is defined here. The wire format belongs to the transport, which must
//! preserve every field of a [`TaskInvocation`] across the round trip.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::Notify, time::Instant};

use crate::task::TaskInvocation;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue closed")]
    Closed,
    #[error("Queue transport error: {0}")]
    Transport(String),
    #[error("Queue in bad state")]
    BadState,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Waits for the next invocation to become deliverable.
    ///
    /// Must be cancel safe: dropping the future before it completes must not lose an invocation.
    async fn receive(&self) -> Result<TaskInvocation, QueueError>;

    /// Enqueues `invocation` to be delivered no sooner than `delay` from now.
    async fn send(&self, invocation: TaskInvocation, delay: Duration) -> Result<(), QueueError>;
}

#[derive(Debug)]
struct Pending {
    ready_at: Instant,
    invocation: TaskInvocation,
}

#[derive(Debug, Default)]
struct Inner {
    pending: Mutex<Vec<Pending>>,
    notify: Notify,
    closed: AtomicBool,
}

/// An in process queue honouring send delays.
///
/// Clones share the same queue.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops accepting invocations and wakes receivers once the queue has drained.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// A snapshot of the invocations not yet received, in the order they were sent.
    pub fn pending(&self) -> Vec<TaskInvocation> {
        self.inner
            .pending
            .lock()
            .map(|pending| pending.iter().map(|p| p.invocation.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.pending.lock().map_or(0, |pending| pending.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the earliest deliverable invocation, or reports when the next one will be.
    fn take_ready(
        &self,
        now: Instant,
    ) -> Result<Result<TaskInvocation, Option<Instant>>, QueueError> {
        let mut pending = self.inner.pending.lock().map_err(|_| QueueError::BadState)?;
        let ready = pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.ready_at <= now)
            .min_by_key(|(_, p)| p.ready_at)
            .map(|(idx, _)| idx);
        if let Some(idx) = ready {
            return Ok(Ok(pending.remove(idx).invocation));
        }
        if pending.is_empty() && self.inner.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        Ok(Err(pending.iter().map(|p| p.ready_at).min()))
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn receive(&self) -> Result<TaskInvocation, QueueError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = match self.take_ready(Instant::now())? {
                Ok(invocation) => return Ok(invocation),
                Err(next) => next,
            };
            match next {
                Some(ready_at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(ready_at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn send(&self, invocation: TaskInvocation, delay: Duration) -> Result<(), QueueError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        self.inner
            .pending
            .lock()
            .map_err(|_| QueueError::BadState)?
            .push(Pending {
                ready_at: Instant::now() + delay,
                invocation,
            });
        self.inner.notify.notify_waiters();
        Ok(())
    }
}
