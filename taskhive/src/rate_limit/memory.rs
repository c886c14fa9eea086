//! Provides an in memory implementation of [`GlobalRateLimiter`].
//!
//! Clones share their buckets, so handing a clone to each simulated instance behaves like a
//! cluster wide limiter within one process. It is intended for tests and single process
//! deployments.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use super::{local::SlidingWindow, GlobalRateLimiter, RateLimitError};

#[derive(Debug, Clone, Default)]
pub struct InMemoryGlobalRateLimiter {
    window: Arc<SlidingWindow>,
}

impl InMemoryGlobalRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GlobalRateLimiter for InMemoryGlobalRateLimiter {
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        permits: u32,
    ) -> Result<u64, RateLimitError> {
        Ok(match self.window.try_take(key, limit, window, permits)? {
            None => 0,
            // A zero hint would read as admitted.
            Some(wait) => u64::try_from(wait.as_millis()).unwrap_or(u64::MAX).max(1),
        })
    }
}
