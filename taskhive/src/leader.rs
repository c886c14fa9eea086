//! Leader election for singleton cron jobs.
//!
//! Leadership is a best effort boolean poll rather than a consensus protocol. The only hard
//! requirement is that it fails safe: when the backend cannot be reached an instance must consider
//! itself a follower, so at worst a singleton tick is skipped cluster wide rather than run twice.
use async_trait::async_trait;
use thiserror::Error;

pub mod memory;

pub use memory::{InMemoryLeaderLock, SoleLeader};

#[derive(Debug, Error)]
pub enum LeaderError {
    #[error("Leader lock backend unavailable: {0}")]
    Unavailable(String),
    #[error("Leader lock in bad state")]
    BadState,
}

/// Answers whether this instance currently holds the cluster wide singleton privilege.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaderLock: Send + Sync {
    async fn try_is_leader(&self) -> Result<bool, LeaderError>;
}

/// The fail safe view of a [`LeaderLock`].
#[async_trait]
pub trait LeaderLockExt: LeaderLock {
    /// Returns `true` iff the lock is held, treating every backend error as not held.
    async fn is_lock(&self) -> bool {
        match self.try_is_leader().await {
            Ok(held) => held,
            Err(error) => {
                tracing::warn!(?error, "Leader lock unavailable, assuming follower: {error}");
                false
            }
        }
    }
}

impl<T> LeaderLockExt for T where T: LeaderLock + ?Sized {}
