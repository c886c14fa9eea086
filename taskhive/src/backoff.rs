//! Retry backoff.
//!
//! Resubmission delays grow linearly with the attempt counter, `delay = ran_times × base`.
//!
//! # Example
//!
//! ```
//! # use taskhive::backoff::{BackoffStrategy, Strategy};
//! # use std::time::Duration;
//! let strategy =
//!     BackoffStrategy::linear(Duration::from_secs(10)).with_max(Duration::from_secs(25));
//!
//! assert_eq!(strategy.backoff(1), Duration::from_secs(10));
//! assert_eq!(strategy.backoff(2), Duration::from_secs(20));
//! assert_eq!(strategy.backoff(3), Duration::from_secs(25));
//! ```

use std::time::Duration;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the number of attempts made so far returns the [`Duration`] to wait before the task
    /// is resubmitted.
    fn backoff(&self, attempt: u32) -> Duration;
}

/// Linear backoff strategy.
///
/// Grows linear with each attempt. It is also possible to set the maximum backoff using
/// [`BackoffStrategy::with_max`].
///
/// __Note:__ This type cannot be constructed directly, instead [`BackoffStrategy::linear`]
/// should be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    factor: Duration,
    max: Option<Duration>,
}

impl Strategy for Linear {
    fn backoff(&self, attempt: u32) -> Duration {
        let mut backoff = self.factor.saturating_mul(attempt);
        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }
        backoff
    }
}

/// Wrapper giving a uniform `const` construction API over backoff strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffStrategy<T> {
    strategy: T,
}

impl BackoffStrategy<Linear> {
    /// Create a linear backoff strategy growing by `factor` per attempt.
    pub const fn linear(factor: Duration) -> Self {
        Self {
            strategy: Linear { factor, max: None },
        }
    }

    /// Cap the backoff at `max`.
    pub const fn with_max(self, max: Duration) -> Self {
        Self {
            strategy: Linear {
                factor: self.strategy.factor,
                max: Some(max),
            },
        }
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u32) -> Duration {
        self.strategy.backoff(attempt)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn linear_backoff() {
        let delay = Duration::from_secs(60);
        let strategy = BackoffStrategy::linear(delay);

        for i in 1..100 {
            assert_eq!(strategy.backoff(i), delay * i);
        }
    }

    #[test]
    fn linear_backoff_with_max() {
        let delay = Duration::from_secs(60);
        let max = Duration::from_secs(600);
        let strategy = BackoffStrategy::linear(delay).with_max(max);

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff <= max);
        }
        assert_eq!(strategy.backoff(10), max);
    }

    #[test]
    fn linear_backoff_saturates() {
        let strategy = BackoffStrategy::linear(Duration::MAX);
        assert_eq!(strategy.backoff(u32::MAX), Duration::MAX);
    }
}
