//! In process [`LeaderLock`] implementations.
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;

use super::{LeaderError, LeaderLock};

#[derive(Debug)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

/// A lease based lock whose state is shared by every contender created from it.
///
/// Polling acquires the lease when it is free or lapsed and renews it when already held, so a
/// holder that stops polling loses leadership once the lease expires.
#[derive(Debug, Clone)]
pub struct InMemoryLeaderLock {
    candidate: String,
    lease: Duration,
    state: Arc<Mutex<Option<Lease>>>,
}

impl InMemoryLeaderLock {
    pub fn new(candidate: impl Into<String>, lease: Duration) -> Self {
        Self {
            candidate: candidate.into(),
            lease,
            state: Default::default(),
        }
    }

    /// Another candidate competing for the same lock.
    pub fn contender(&self, candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            lease: self.lease,
            state: self.state.clone(),
        }
    }

    /// Gives up the lease if this candidate holds it.
    pub fn release(&self) -> Result<bool, LeaderError> {
        let mut state = self.state.lock().map_err(|_| LeaderError::BadState)?;
        if state
            .as_ref()
            .is_some_and(|lease| lease.holder == self.candidate)
        {
            *state = None;
            return Ok(true);
        }
        Ok(false)
    }
}

#[async_trait]
impl LeaderLock for InMemoryLeaderLock {
    async fn try_is_leader(&self) -> Result<bool, LeaderError> {
        let now = Instant::now();
        let mut state = self.state.lock().map_err(|_| LeaderError::BadState)?;
        let held = state
            .as_ref()
            .is_some_and(|lease| lease.holder == self.candidate);
        let taken = state.as_ref().is_some_and(|lease| lease.expires_at > now);
        if taken && !held {
            return Ok(false);
        }
        if !held {
            tracing::debug!(candidate = %self.candidate, "Acquired leader lease");
        }
        *state = Some(Lease {
            holder: self.candidate.clone(),
            expires_at: now + self.lease,
        });
        Ok(true)
    }
}

/// Always the leader, for deployments running a single instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoleLeader;

#[async_trait]
impl LeaderLock for SoleLeader {
    async fn try_is_leader(&self) -> Result<bool, LeaderError> {
        Ok(true)
    }
}
