//! Admission control.
//!
//! Two limiter tiers share the same dimensioning mechanism: the [`RateLimitDimension`] of a task
//! definition decides how the [`LockerKey`] is composed, and therefore which bucket an invocation
//! is counted against.
//!
//! - A [`LocalRateLimiter`] is process private and may itself block up to the maximum wait.
//! - A [`GlobalRateLimiter`] is shared by every instance in the cluster and never blocks. It
//!   answers with a wait hint instead and [`AdmissionControl`] polls it until the deadline.
use std::{fmt::Display, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::task::{RateLimit, RateLimitDimension};

pub mod local;
pub mod memory;

pub use local::SlidingWindowRateLimiter;
pub use memory::InMemoryGlobalRateLimiter;

const LOCAL_KEY: &str = "taskhive:local";

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Rate limiter backend unavailable: {0}")]
    Unavailable(String),
    #[error("Rate limiter in bad state")]
    BadState,
}

/// A process private rate limiter.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LocalRateLimiter: Send + Sync {
    /// Attempts to take `permits` from the bucket `key`, allowing `limit` permits per `window`.
    ///
    /// Waits up to `max_wait` for permits to become available, returning whether they were
    /// acquired.
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        max_wait: Duration,
        permits: u32,
    ) -> Result<bool, RateLimitError>;
}

/// A cluster wide rate limiter.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GlobalRateLimiter: Send + Sync {
    /// Attempts to take `permits` from the bucket `key` without waiting.
    ///
    /// Returns `0` when the permits were acquired, otherwise the number of milliseconds the
    /// caller should wait before trying again.
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        permits: u32,
    ) -> Result<u64, RateLimitError>;
}

/// The identity of a rate limit bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockerKey(String);

impl LockerKey {
    /// Composes the key for an invocation of `task_class`, or [`None`] when the dimension does not
    /// limit admission.
    ///
    /// A missing tag counts against the empty tag's bucket.
    pub fn compose(
        dimension: RateLimitDimension,
        task_class: &str,
        tag: Option<&str>,
        host_id: &str,
    ) -> Option<Self> {
        let tag = tag.unwrap_or_default();
        let key = match dimension {
            RateLimitDimension::None => return None,
            RateLimitDimension::Local => LOCAL_KEY.to_owned(),
            RateLimitDimension::LocalTask | RateLimitDimension::GlobalTask => task_class.to_owned(),
            RateLimitDimension::LocalTaskTag | RateLimitDimension::GlobalTaskTag => {
                format!("{task_class}:{tag}")
            }
            RateLimitDimension::GlobalTaskHost => format!("{task_class}@{host_id}"),
            RateLimitDimension::GlobalTaskTagHost => format!("{task_class}:{tag}@{host_id}"),
        };
        Some(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LockerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimiterTier {
    Local,
    Global,
}

impl Display for LimiterTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Global => f.write_str("global"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Denied { tier: LimiterTier, reason: String },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Applies a task definition's [`RateLimit`] using the configured limiter tiers.
#[derive(Clone)]
pub struct AdmissionControl {
    local: Arc<dyn LocalRateLimiter>,
    global: Option<Arc<dyn GlobalRateLimiter>>,
    host_id: String,
}

impl AdmissionControl {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            local: Arc::new(SlidingWindowRateLimiter::default()),
            global: None,
            host_id: host_id.into(),
        }
    }

    pub fn with_local(self, local: Arc<dyn LocalRateLimiter>) -> Self {
        Self { local, ..self }
    }

    pub fn with_global(self, global: Arc<dyn GlobalRateLimiter>) -> Self {
        Self {
            global: Some(global),
            ..self
        }
    }

    pub async fn admit(
        &self,
        rate_limit: &RateLimit,
        task_class: &str,
        tag: Option<&str>,
    ) -> Admission {
        let dimension = rate_limit.dimension;
        let Some(key) = LockerKey::compose(dimension, task_class, tag, &self.host_id) else {
            return Admission::Granted;
        };
        let tier = if dimension.is_global() {
            LimiterTier::Global
        } else {
            LimiterTier::Local
        };

        let admitted = match tier {
            LimiterTier::Local => self
                .local
                .try_acquire(
                    key.as_str(),
                    rate_limit.limit,
                    rate_limit.window(),
                    rate_limit.max_wait(),
                    rate_limit.permits,
                )
                .await
                .inspect_err(|error| {
                    tracing::error!(?error, %key, "Local rate limiter failed, denying: {error}")
                })
                .unwrap_or(false),
            LimiterTier::Global => self.admit_global(&key, rate_limit).await,
        };

        if admitted {
            Admission::Granted
        } else {
            Admission::Denied {
                tier,
                reason: format!(
                    "Rate limited by {tier} limiter on {key}: limit {} per {}s, waited up to {}s",
                    rate_limit.limit, rate_limit.window_secs, rate_limit.max_wait_secs
                ),
            }
        }
    }

    /// Polls the global limiter until it admits or the wait deadline would be passed.
    async fn admit_global(&self, key: &LockerKey, rate_limit: &RateLimit) -> bool {
        let Some(global) = &self.global else {
            tracing::error!(%key, "No global rate limiter configured, denying");
            return false;
        };
        let deadline = Instant::now() + rate_limit.max_wait();
        loop {
            let wait = match global
                .try_acquire(
                    key.as_str(),
                    rate_limit.limit,
                    rate_limit.window(),
                    rate_limit.permits,
                )
                .await
            {
                Ok(0) => return true,
                Ok(wait) => Duration::from_millis(wait),
                Err(error) => {
                    tracing::error!(?error, %key, "Global rate limiter failed, denying: {error}");
                    return false;
                }
            };
            if deadline.saturating_duration_since(Instant::now()) < wait {
                return false;
            }
            tracing::trace!(%key, ?wait, "Waiting for global rate limit");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use mockall::predicate::eq;

    use super::*;

    #[test]
    fn locker_key_composition() {
        let compose = |dimension| LockerKey::compose(dimension, "report", Some("p1"), "host-a");

        assert_eq!(compose(RateLimitDimension::None), None);
        assert_eq!(compose(RateLimitDimension::Local).unwrap().as_str(), LOCAL_KEY);
        assert_eq!(compose(RateLimitDimension::LocalTask).unwrap().as_str(), "report");
        assert_eq!(compose(RateLimitDimension::LocalTaskTag).unwrap().as_str(), "report:p1");
        assert_eq!(compose(RateLimitDimension::GlobalTask).unwrap().as_str(), "report");
        assert_eq!(compose(RateLimitDimension::GlobalTaskTag).unwrap().as_str(), "report:p1");
        assert_eq!(
            compose(RateLimitDimension::GlobalTaskHost).unwrap().as_str(),
            "report@host-a"
        );
        assert_eq!(
            compose(RateLimitDimension::GlobalTaskTagHost).unwrap().as_str(),
            "report:p1@host-a"
        );
    }

    #[test]
    fn missing_tag_uses_empty_bucket() {
        let key = LockerKey::compose(RateLimitDimension::LocalTaskTag, "report", None, "host");
        assert_eq!(key.unwrap().as_str(), "report:");
    }

    #[tokio::test]
    async fn no_dimension_always_admits() {
        let mut local = MockLocalRateLimiter::new();
        local.expect_try_acquire().never();
        let admission = AdmissionControl::new("host").with_local(Arc::new(local));

        let result = admission.admit(&RateLimit::default(), "report", None).await;

        assert!(result.is_granted());
    }

    #[tokio::test]
    async fn local_denial_names_tier() {
        let mut local = MockLocalRateLimiter::new();
        local
            .expect_try_acquire()
            .withf(|key, limit, _, _, permits| key == "report" && *limit == 5 && *permits == 1)
            .returning(|_, _, _, _, _| Ok(false));
        let admission = AdmissionControl::new("host").with_local(Arc::new(local));
        let rate_limit = RateLimit::new(RateLimitDimension::LocalTask, 5, Duration::from_secs(1));

        let result = admission.admit(&rate_limit, "report", None).await;

        assert_matches!(
            result,
            Admission::Denied {
                tier: LimiterTier::Local,
                reason,
            } if reason.contains("limit 5 per 1s")
        );
    }

    #[tokio::test]
    async fn local_error_denies() {
        let mut local = MockLocalRateLimiter::new();
        local
            .expect_try_acquire()
            .returning(|_, _, _, _, _| Err(RateLimitError::BadState));
        let admission = AdmissionControl::new("host").with_local(Arc::new(local));
        let rate_limit = RateLimit::new(RateLimitDimension::Local, 5, Duration::from_secs(1));

        assert!(!admission.admit(&rate_limit, "report", None).await.is_granted());
    }

    #[tokio::test(start_paused = true)]
    async fn global_polls_with_wait_hint_until_admitted() {
        let mut global = MockGlobalRateLimiter::new();
        let mut seq = mockall::Sequence::new();
        global
            .expect_try_acquire()
            .with(
                eq("report:p1@host"),
                eq(10),
                eq(Duration::from_secs(1)),
                eq(1),
            )
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(400));
        global
            .expect_try_acquire()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(0));
        let admission = AdmissionControl::new("host").with_global(Arc::new(global));
        let rate_limit = RateLimit::new(
            RateLimitDimension::GlobalTaskTagHost,
            10,
            Duration::from_secs(1),
        )
        .with_max_wait(Duration::from_secs(2));
        let start = Instant::now();

        let result = admission.admit(&rate_limit, "report", Some("p1")).await;

        assert!(result.is_granted());
        assert!(start.elapsed() >= Duration::from_millis(800));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn global_denies_when_hint_exceeds_deadline() {
        let mut global = MockGlobalRateLimiter::new();
        global
            .expect_try_acquire()
            .times(1)
            .returning(|_, _, _, _| Ok(5_000));
        let admission = AdmissionControl::new("host").with_global(Arc::new(global));
        let rate_limit = RateLimit::new(RateLimitDimension::GlobalTask, 10, Duration::from_secs(10))
            .with_max_wait(Duration::from_secs(1));

        let result = admission.admit(&rate_limit, "report", None).await;

        assert_matches!(result, Admission::Denied { tier: LimiterTier::Global, .. });
    }

    #[tokio::test]
    async fn global_error_denies() {
        let mut global = MockGlobalRateLimiter::new();
        global
            .expect_try_acquire()
            .returning(|_, _, _, _| Err(RateLimitError::Unavailable("down".to_owned())));
        let admission = AdmissionControl::new("host").with_global(Arc::new(global));
        let rate_limit = RateLimit::new(RateLimitDimension::GlobalTask, 10, Duration::from_secs(1));

        assert!(!admission.admit(&rate_limit, "report", None).await.is_granted());
    }

    #[tokio::test]
    async fn global_dimension_without_limiter_denies() {
        let admission = AdmissionControl::new("host");
        let rate_limit = RateLimit::new(RateLimitDimension::GlobalTask, 10, Duration::from_secs(1));

        assert!(!admission.admit(&rate_limit, "report", None).await.is_granted());
    }
}
