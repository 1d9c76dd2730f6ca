//! Durable workflow engine.
//!
//! Workflows are deterministic async functions whose side effects happen
//! only through activities. Every completed activity or child workflow is
//! written to the step history, so a workflow interrupted by a restart is
//! re-run from the top and replays recorded results instead of repeating
//! work. Signals are persisted and wake any `wait_condition` on the target.
//!
//! The contract lives here; `LocalEngine` is the SQLite-backed
//! implementation that runs inside the server process.

mod context;
mod local;
mod retry;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::{ActivityError, EngineError, WorkflowError};

pub use context::{ActivityContext, ActivityInfo, SignalSet, WorkflowContext};
pub use local::{EngineBuilder, LocalEngine, WorkflowHandle};
pub use retry::RetryPolicy;

pub const DEFAULT_TASK_QUEUE: &str = "spaghettihub";

/// A unit of side-effecting work. Runs at least once per successful step;
/// implementations must tolerate re-execution.
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    const NAME: &'static str;
    type Input: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    async fn run(&self, ctx: ActivityContext, input: Self::Input)
    -> Result<Self::Output, ActivityError>;
}

/// Deterministic orchestration of activities, child workflows and signals.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    const NAME: &'static str;
    type Input: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    async fn run(&self, ctx: WorkflowContext, input: Self::Input)
    -> Result<Self::Output, WorkflowError>;
}

/// An ordered, externally observable state of a saga. Ranks only move up.
pub trait SagaPhase: Copy + Send + Sync + 'static {
    fn as_str(&self) -> &'static str;
    fn rank(&self) -> i64;
}

#[derive(Debug, Clone)]
pub struct ActivityOptions {
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Option<Duration>,
    /// `None` uses the unbounded default.
    pub retry_policy: Option<RetryPolicy>,
    /// When false a successful output is not written to history and the
    /// activity runs again on replay. For short-lived secrets.
    pub persist_output: bool,
}

impl ActivityOptions {
    pub fn new(start_to_close_timeout: Duration) -> Self {
        Self {
            start_to_close_timeout,
            heartbeat_timeout: None,
            retry_policy: None,
            persist_output: true,
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn transient(mut self) -> Self {
        self.persist_output = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    pub id: String,
    pub task_queue: String,
    /// `None` runs the workflow once.
    pub retry_policy: Option<RetryPolicy>,
    pub execution_timeout: Option<Duration>,
}

impl WorkflowOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            retry_policy: None,
            execution_timeout: None,
        }
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}

/// Object-safe client surface used by the HTTP layer and the dispatchers.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Start a workflow by registered type name. Starting an id that is
    /// already running returns a handle to the running instance.
    async fn start_workflow_raw(
        &self,
        workflow_type: &str,
        input: Value,
        options: WorkflowOptions,
    ) -> Result<WorkflowHandle, EngineError>;

    /// Deliver a named signal to a running workflow.
    async fn signal(
        &self,
        workflow_id: &str,
        signal_name: &str,
        payload: Option<Value>,
    ) -> Result<(), EngineError>;
}

/// Typed helpers over [`WorkflowClient`].
#[async_trait]
pub trait WorkflowClientExt: WorkflowClient {
    async fn start_workflow<W: Workflow>(
        &self,
        input: &W::Input,
        options: WorkflowOptions,
    ) -> Result<WorkflowHandle, EngineError> {
        let input = serde_json::to_value(input)?;
        self.start_workflow_raw(W::NAME, input, options).await
    }
}

impl<T: WorkflowClient + ?Sized> WorkflowClientExt for T {}
