//! Task bodies and the registry that resolves a task class to one.
use std::{
    collections::hash_map::Entry,
    error::Error,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use fxhash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::Instrument;

use crate::task::{ExecutionState, Task, TaskInvocation};

const ERROR_TYPE_PANIC: &str = "panic";
const ERROR_TYPE_TIMEOUT: &str = "timeout";
const ERROR_TYPE_DECODE: &str = "decode";
const ERROR_TYPE_UNREGISTERED: &str = "unregistered";

/// An executable task body.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// The type the invocation payload is decoded into.
    ///
    /// If this is not needed it can be set to unit `()`, or [`serde_json::Value`] to receive the
    /// raw payload.
    type Data: DeserializeOwned + Send;
    /// The task class served by this executor.
    ///
    /// Invocations and cron definitions refer to executors by this name.
    const NAME: &'static str;

    async fn execute(&self, task: Task<Self::Data>) -> ExecutionResult;
}

pub enum ExecutionResult {
    Done,
    /// Completed and produced a result to be handed back to RPC and local callers.
    Output {
        result: Value,
    },
    Error {
        error: Box<dyn ExecutionError>,
    },
}

impl<T> From<T> for ExecutionResult
where
    T: ExecutionError + 'static,
{
    fn from(value: T) -> Self {
        Self::Error {
            error: Box::new(value),
        }
    }
}

/// How a failure is attributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The input to the invocation is invalid; never retried.
    Data,
    /// A dependency failed; retried within the partner threshold.
    Partner,
    /// Anything else, treated as a bug; never retried.
    Program,
}

impl FailureKind {
    pub fn state(self) -> ExecutionState {
        match self {
            Self::Data => ExecutionState::FailData,
            Self::Partner => ExecutionState::FailPartner,
            Self::Program => ExecutionState::FailProgram,
        }
    }
}

pub trait ExecutionError: Error + Send {
    fn error_type(&self) -> &'static str;

    fn kind(&self) -> FailureKind {
        FailureKind::Program
    }
}

/// The input handed to the task is invalid.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct DataError(pub String);

impl ExecutionError for DataError {
    fn error_type(&self) -> &'static str {
        "data"
    }

    fn kind(&self) -> FailureKind {
        FailureKind::Data
    }
}

/// A counterparty of the task failed.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PartnerError(pub String);

impl ExecutionError for PartnerError {
    fn error_type(&self) -> &'static str {
        "partner"
    }

    fn kind(&self) -> FailureKind {
        FailureKind::Partner
    }
}

#[async_trait]
pub(crate) trait ErasedExecutor: Send + Sync {
    async fn execute(&self, invocation: &TaskInvocation) -> ExecutionResult;
}

struct Erased<E>(E);

#[async_trait]
impl<E> ErasedExecutor for Erased<E>
where
    E: Executor,
{
    async fn execute(&self, invocation: &TaskInvocation) -> ExecutionResult {
        match Task::<E::Data>::try_from(invocation) {
            Ok(task) => self.0.execute(task).await,
            Err(error) => ExecutionResult::Error {
                error: Box::new(Failure {
                    error_type: ERROR_TYPE_DECODE,
                    kind: FailureKind::Data,
                    message: format!("Failed to decode payload for {}: {error}", E::NAME),
                }),
            },
        }
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
struct Failure {
    error_type: &'static str,
    kind: FailureKind,
    message: String,
}

impl ExecutionError for Failure {
    fn error_type(&self) -> &'static str {
        self.error_type
    }

    fn kind(&self) -> FailureKind {
        self.kind
    }
}

/// Resolves task classes to executors.
///
/// Cloning is cheap; clones share the same registrations.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: Arc<RwLock<FxHashMap<&'static str, Arc<dyn ErasedExecutor>>>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let executors = self.executors.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ExecutorRegistry")
            .field("executors", &executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executor<E>(self, executor: E) -> Self
    where
        E: Executor,
    {
        self.register(executor);
        self
    }

    /// Registers an executor under [`Executor::NAME`], returning `false` when it replaced an
    /// existing registration.
    pub fn register<E>(&self, executor: E) -> bool
    where
        E: Executor,
    {
        let mut executors = self
            .executors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match executors.entry(E::NAME) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Erased(executor)));
                true
            }
            Entry::Occupied(mut entry) => {
                tracing::warn!(task_class = E::NAME, "Replacing executor for {}", E::NAME);
                entry.insert(Arc::new(Erased(executor)));
                false
            }
        }
    }

    pub fn contains(&self, task_class: &str) -> bool {
        self.executors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(task_class)
    }

    fn get(&self, task_class: &str) -> Option<Arc<dyn ErasedExecutor>> {
        self.executors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_class)
            .cloned()
    }

    /// Runs the task body for `invocation`, classifying whatever happens into an [`Outcome`].
    ///
    /// The body runs on its own task so a panic is caught and reported as a program failure.
    pub(crate) async fn run(
        &self,
        invocation: &TaskInvocation,
        timeout: Option<Duration>,
    ) -> Outcome {
        let Some(executor) = self.get(&invocation.task_class) else {
            return Outcome::failed(
                FailureKind::Program,
                ERROR_TYPE_UNREGISTERED,
                format!("No executor registered for {}", invocation.task_class),
            );
        };

        let owned = invocation.clone();
        let fut = async move { executor.execute(&owned).await }.in_current_span();
        let handle = tokio::spawn(async move {
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, fut).await.map_err(|_| timeout),
                None => Ok(fut.await),
            }
        });

        match handle.await {
            Ok(Ok(result)) => result.into(),
            Ok(Err(timeout)) => timeout.into(),
            Err(error) => error.into(),
        }
    }
}

/// The classified result of running a task body once.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Outcome {
    pub(crate) state: ExecutionState,
    pub(crate) result: Option<Value>,
    pub(crate) error: Option<String>,
}

impl Outcome {
    fn failed(kind: FailureKind, error_type: &str, message: String) -> Self {
        Self {
            state: kind.state(),
            result: None,
            error: Some(format!("{error_type}: {message}")),
        }
    }
}

impl From<ExecutionResult> for Outcome {
    fn from(value: ExecutionResult) -> Self {
        match value {
            ExecutionResult::Done => Self {
                state: ExecutionState::Success,
                result: None,
                error: None,
            },
            ExecutionResult::Output { result } => Self {
                state: ExecutionState::Success,
                result: Some(result),
                error: None,
            },
            ExecutionResult::Error { error } => {
                Self::failed(error.kind(), error.error_type(), error.to_string())
            }
        }
    }
}

impl From<JoinError> for Outcome {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::failed(FailureKind::Program, ERROR_TYPE_PANIC, message)
    }
}

impl From<Duration> for Outcome {
    fn from(value: Duration) -> Self {
        Self::failed(
            FailureKind::Program,
            ERROR_TYPE_TIMEOUT,
            format!("Task failed to complete within timeout: {value:?}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::{
        task::RunMode,
        testing::{Script, ScriptedExecutor},
    };

    fn invocation(script: Script) -> TaskInvocation {
        TaskInvocation::new(
            ScriptedExecutor::NAME,
            RunMode::Local,
            serde_json::to_value(script).unwrap(),
        )
    }

    fn registry() -> ExecutorRegistry {
        ExecutorRegistry::new().with_executor(ScriptedExecutor::default())
    }

    #[tokio::test]
    async fn done_is_success() {
        let outcome = registry().run(&invocation(Script::Done), None).await;
        assert_eq!(outcome.state, ExecutionState::Success);
        assert_eq!(outcome.error, None);
    }

    #[tokio::test]
    async fn output_is_kept() {
        let outcome = registry()
            .run(&invocation(Script::Output(json!({"rows": 3}))), None)
            .await;
        assert_eq!(outcome.state, ExecutionState::Success);
        assert_eq!(outcome.result, Some(json!({"rows": 3})));
    }

    #[tokio::test]
    async fn failures_are_classified() {
        let registry = registry();
        let data = registry.run(&invocation(Script::DataError), None).await;
        let partner = registry.run(&invocation(Script::PartnerError), None).await;
        let program = registry.run(&invocation(Script::ProgramError), None).await;

        assert_eq!(data.state, ExecutionState::FailData);
        assert_eq!(partner.state, ExecutionState::FailPartner);
        assert_eq!(program.state, ExecutionState::FailProgram);
        assert_matches!(partner.error.as_deref(), Some(message) if message.starts_with("partner"));
    }

    #[tokio::test]
    async fn panic_is_program_failure() {
        let outcome = registry().run(&invocation(Script::Panic), None).await;
        assert_eq!(outcome.state, ExecutionState::FailProgram);
        assert_matches!(
            outcome.error.as_deref(),
            Some(message) if message.contains("scripted panic")
        );
    }

    #[tokio::test]
    async fn timeout_is_program_failure() {
        let outcome = registry()
            .run(
                &invocation(Script::Sleep { millis: 200 }),
                Some(Duration::from_millis(10)),
            )
            .await;
        assert_eq!(outcome.state, ExecutionState::FailProgram);
        assert_matches!(outcome.error.as_deref(), Some(message) if message.starts_with("timeout"));
    }

    #[tokio::test]
    async fn undecodable_payload_is_data_failure() {
        let invocation = TaskInvocation::new(ScriptedExecutor::NAME, RunMode::Local, json!(42));
        let outcome = registry().run(&invocation, None).await;
        assert_eq!(outcome.state, ExecutionState::FailData);
    }

    #[tokio::test]
    async fn unregistered_class_is_program_failure() {
        let invocation = TaskInvocation::new("missing", RunMode::Local, Value::Null);
        let outcome = registry().run(&invocation, None).await;
        assert_eq!(outcome.state, ExecutionState::FailProgram);
    }

    #[test]
    fn registering_twice_replaces() {
        let registry = ExecutorRegistry::new();
        assert!(registry.register(ScriptedExecutor::default()));
        assert!(!registry.register(ScriptedExecutor::default()));
        assert!(registry.contains(ScriptedExecutor::NAME));
    }
}
