//! A process local sliding window rate limiter.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use fxhash::FxHashMap;
use tokio::time::Instant;

use super::{LocalRateLimiter, RateLimitError};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Sliding window log keyed by locker key.
///
/// Each bucket remembers when its permits were granted; a permit frees up once it is older than
/// the window. Buckets whose permits have all expired are swept out.
#[derive(Debug)]
pub(crate) struct SlidingWindow {
    state: Mutex<Buckets>,
}

#[derive(Debug)]
struct Buckets {
    buckets: FxHashMap<String, Bucket>,
    last_sweep: Instant,
}

#[derive(Debug, Default)]
struct Bucket {
    window: Duration,
    granted: VecDeque<Instant>,
}

impl Bucket {
    fn prune(&mut self, now: Instant) {
        while self
            .granted
            .front()
            .is_some_and(|granted| now.saturating_duration_since(*granted) >= self.window)
        {
            self.granted.pop_front();
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.granted
            .back()
            .map_or(true, |last| now.saturating_duration_since(*last) >= self.window)
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self {
            state: Mutex::new(Buckets {
                buckets: FxHashMap::default(),
                last_sweep: Instant::now(),
            }),
        }
    }
}

impl SlidingWindow {
    /// Takes the permits if available, otherwise returns how long until they could be.
    pub(crate) fn try_take(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        permits: u32,
    ) -> Result<Option<Duration>, RateLimitError> {
        if permits > limit {
            return Ok(Some(Duration::MAX));
        }
        let now = Instant::now();
        let mut state = self.state.lock().map_err(|_| RateLimitError::BadState)?;
        if now.saturating_duration_since(state.last_sweep) >= SWEEP_INTERVAL {
            state.buckets.retain(|_, bucket| !bucket.is_expired(now));
            state.last_sweep = now;
        }

        let bucket = state.buckets.entry(key.to_owned()).or_default();
        bucket.window = window;
        bucket.prune(now);

        let needed = bucket.granted.len() + permits as usize;
        let limit = limit as usize;
        if needed <= limit {
            bucket
                .granted
                .extend(std::iter::repeat(now).take(permits as usize));
            if bucket.granted.is_empty() {
                state.buckets.remove(key);
            }
            return Ok(None);
        }
        // The permit that has to expire before enough are free.
        let blocking = bucket.granted[needed - limit - 1];
        Ok(Some((blocking + window).saturating_duration_since(now)))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.buckets.len())
            .unwrap_or_default()
    }
}

/// The default [`LocalRateLimiter`].
#[derive(Debug, Clone, Default)]
pub struct SlidingWindowRateLimiter {
    window: Arc<SlidingWindow>,
}

impl SlidingWindowRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalRateLimiter for SlidingWindowRateLimiter {
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        max_wait: Duration,
        permits: u32,
    ) -> Result<bool, RateLimitError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let Some(wait) = self.window.try_take(key, limit, window, permits)? else {
                return Ok(true);
            };
            if deadline.saturating_duration_since(Instant::now()) < wait {
                return Ok(false);
            }
            tokio::time::sleep(wait).await;
        }
    }
}
