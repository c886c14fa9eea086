//! The purpose of this module is to alleviate the need to import many of the `[taskhive]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use taskhive::prelude::*;
//! ```
pub use crate::backoff::{BackoffStrategy, Strategy};
pub use crate::config::{ConfigProvider, DefinitionRegistry, Definitions};
pub use crate::croner::TaskCroner;
pub use crate::executor::{
    DataError, ExecutionError, ExecutionResult, Executor, ExecutorRegistry, FailureKind,
    PartnerError,
};
pub use crate::leader::{LeaderLock, LeaderLockExt};
pub use crate::overflow::Submission;
pub use crate::queue::{InMemoryQueue, QueueTransport};
pub use crate::runner::TaskRunner;
pub use crate::settings::Settings;
pub use crate::task::{
    CronDefinition, ExecutionState, RateLimit, RateLimitDimension, RetryPolicy, RunMode, RunType,
    Task, TaskDefinition, TaskInvocation,
};
pub use crate::Taskhive;
