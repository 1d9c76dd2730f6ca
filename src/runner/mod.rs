//! Ephemeral runner provisioning saga.
//!
//! One saga per queued self-hosted job:
//!
//! ```text
//! QUEUED -> TOKEN_ACQUIRED -> VM_SPAWNED -> AWAITING_COMPLETION
//!        -> SIGNALED_COMPLETE | TIMED_OUT -> DESTROYED
//! ```
//!
//! The outer workflow (`github-runner-<n>`) owns teardown. It runs the
//! provisioning child (`internal-runner-<n>`) under an execution timeout and
//! then destroys the VM whatever the child's outcome.

pub mod activities;
pub mod cloud_init;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spaghettihub_common::RunnerSagaId;
use tracing::{info, warn};

use crate::engine::{
    ActivityOptions, RetryPolicy, SagaPhase, Workflow, WorkflowContext, WorkflowOptions,
};
use crate::errors::WorkflowError;

pub use activities::{DestroyRunner, GetRegistrationToken, SpawnRunner, SpawnRunnerInput, SpawnSettings};
pub use cloud_init::RunnerRelease;

/// Signal that releases the provisioning workflow.
pub const COMPLETED_SIGNAL: &str = "completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerPhase {
    Queued,
    TokenAcquired,
    VmSpawned,
    AwaitingCompletion,
    SignaledComplete,
    TimedOut,
    Destroyed,
}

impl SagaPhase for RunnerPhase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::TokenAcquired => "TOKEN_ACQUIRED",
            Self::VmSpawned => "VM_SPAWNED",
            Self::AwaitingCompletion => "AWAITING_COMPLETION",
            Self::SignaledComplete => "SIGNALED_COMPLETE",
            Self::TimedOut => "TIMED_OUT",
            Self::Destroyed => "DESTROYED",
        }
    }

    fn rank(&self) -> i64 {
        match self {
            Self::Queued => 0,
            Self::TokenAcquired => 1,
            Self::VmSpawned => 2,
            Self::AwaitingCompletion => 3,
            Self::SignaledComplete | Self::TimedOut => 4,
            Self::Destroyed => 5,
        }
    }
}

/// Input of both runner workflows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerRequest {
    pub id: RunnerSagaId,
    pub run_url: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerOutcome {
    /// The job finished and signalled completion.
    Completed,
    /// No completion arrived before the execution timeout.
    TimedOut,
    /// Provisioning failed.
    Failed,
}

/// Timeouts and retry policies of the runner saga.
#[derive(Debug, Clone)]
pub struct RunnerSagaSettings {
    /// Bounds provisioning plus the job itself.
    pub execution_timeout: Duration,
    pub token_timeout: Duration,
    pub token_retry: RetryPolicy,
    pub spawn_timeout: Duration,
    pub spawn_heartbeat: Duration,
    pub spawn_retry: RetryPolicy,
    pub destroy_timeout: Duration,
    pub destroy_heartbeat: Duration,
    pub destroy_retry: RetryPolicy,
}

impl Default for RunnerSagaSettings {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(24 * 60 * 60),
            token_timeout: Duration::from_secs(60),
            token_retry: RetryPolicy::bounded(10, Duration::from_secs(1), Duration::from_secs(100)),
            spawn_timeout: Duration::from_secs(600),
            spawn_heartbeat: Duration::from_secs(30),
            spawn_retry: RetryPolicy::bounded(3, Duration::from_secs(10), Duration::from_secs(60)),
            destroy_timeout: Duration::from_secs(300),
            destroy_heartbeat: Duration::from_secs(60),
            destroy_retry: RetryPolicy::default(),
        }
    }
}

impl RunnerSagaSettings {
    fn token_options(&self) -> ActivityOptions {
        ActivityOptions::new(self.token_timeout)
            .with_retry_policy(self.token_retry.clone())
            .transient()
    }

    fn spawn_options(&self) -> ActivityOptions {
        ActivityOptions::new(self.spawn_timeout)
            .with_heartbeat_timeout(self.spawn_heartbeat)
            .with_retry_policy(self.spawn_retry.clone())
    }

    fn destroy_options(&self) -> ActivityOptions {
        ActivityOptions::new(self.destroy_timeout)
            .with_heartbeat_timeout(self.destroy_heartbeat)
            .with_retry_policy(self.destroy_retry.clone())
    }
}

/// Provisions the runner and waits for the job to finish.
pub struct ProvisionRunnerWorkflow {
    settings: RunnerSagaSettings,
}

impl ProvisionRunnerWorkflow {
    pub fn new(settings: RunnerSagaSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Workflow for ProvisionRunnerWorkflow {
    const NAME: &'static str = "internal-github-runner-workflow";
    type Input = RunnerRequest;
    type Output = ();

    async fn run(&self, ctx: WorkflowContext, request: RunnerRequest) -> Result<(), WorkflowError> {
        let token = ctx
            .execute_activity::<GetRegistrationToken>(request.id, self.settings.token_options())
            .await?;
        ctx.advance_phase(RunnerPhase::TokenAcquired).await?;

        let vm = ctx
            .execute_activity::<SpawnRunner>(
                SpawnRunnerInput {
                    id: request.id,
                    labels: request.labels.clone(),
                    registration_token: token.token,
                },
                self.settings.spawn_options(),
            )
            .await?;
        ctx.advance_phase(RunnerPhase::VmSpawned).await?;

        ctx.advance_phase(RunnerPhase::AwaitingCompletion).await?;
        info!(run_id = request.id.run_id(), vm = %vm, run_url = %request.run_url, "Waiting for job completion");
        ctx.wait_condition(|signals| signals.contains(COMPLETED_SIGNAL))
            .await?;
        ctx.advance_phase(RunnerPhase::SignaledComplete).await?;
        Ok(())
    }
}

/// Runs provisioning under the execution timeout, then always tears down.
pub struct RunnerSagaWorkflow {
    settings: RunnerSagaSettings,
}

impl RunnerSagaWorkflow {
    pub fn new(settings: RunnerSagaSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Workflow for RunnerSagaWorkflow {
    const NAME: &'static str = "github-runner-workflow";
    type Input = RunnerRequest;
    type Output = RunnerOutcome;

    async fn run(
        &self,
        ctx: WorkflowContext,
        request: RunnerRequest,
    ) -> Result<RunnerOutcome, WorkflowError> {
        ctx.advance_phase(RunnerPhase::Queued).await?;

        let child = WorkflowOptions::new(request.id.workflow_id())
            .with_task_queue(ctx.task_queue())
            .with_retry_policy(RetryPolicy::no_retry())
            .with_execution_timeout(self.settings.execution_timeout);
        let outcome = match ctx
            .execute_child_workflow::<ProvisionRunnerWorkflow>(request.clone(), child)
            .await
        {
            Ok(()) => RunnerOutcome::Completed,
            Err(e) if e.is_timeout() => {
                ctx.advance_phase(RunnerPhase::TimedOut).await?;
                info!(run_id = request.id.run_id(), "No completion signal before timeout");
                RunnerOutcome::TimedOut
            }
            Err(e) => {
                warn!(run_id = request.id.run_id(), error = %e, "Runner provisioning failed");
                RunnerOutcome::Failed
            }
        };

        ctx.execute_activity::<DestroyRunner>(request.id, self.settings.destroy_options())
            .await?;
        ctx.advance_phase(RunnerPhase::Destroyed).await?;
        info!(run_id = request.id.run_id(), outcome = ?outcome, "Runner saga finished");
        Ok(outcome)
    }
}
