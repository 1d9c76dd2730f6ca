//! Launchpad merge proposal to GitHub pull request saga.
//!
//! ```text
//! NEW -> DIFF_RETRIEVED -> FORK_SYNCED -> BRANCH_CREATED -> PR_OPENED
//!     -> COMPLETED | FAILED
//! ```
//!
//! The outer workflow wraps the steps in one child workflow and always
//! finishes by writing the terminal status to the porting work record.

pub mod activities;
pub mod service;
pub mod vcs;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spaghettihub_common::WorkStatus;
use tracing::{info, warn};

use crate::engine::{
    ActivityOptions, RetryPolicy, SagaPhase, Workflow, WorkflowContext, WorkflowOptions,
};
use crate::errors::WorkflowError;

pub use activities::{
    BranchRequest, CompleteRequest, CompleteRequestInput, CreatePullRequestBranch,
    OpenPullRequest, PullRequestInput, PullRequestSettings, RetrieveMergeProposal, SyncFork,
};
pub use service::PortingService;
pub use vcs::{GitVcs, GitVcsSettings, MergeOutcome, Vcs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortingPhase {
    New,
    DiffRetrieved,
    ForkSynced,
    BranchCreated,
    PrOpened,
    Completed,
    Failed,
}

impl SagaPhase for PortingPhase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::DiffRetrieved => "DIFF_RETRIEVED",
            Self::ForkSynced => "FORK_SYNCED",
            Self::BranchCreated => "BRANCH_CREATED",
            Self::PrOpened => "PR_OPENED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    fn rank(&self) -> i64 {
        match self {
            Self::New => 0,
            Self::DiffRetrieved => 1,
            Self::ForkSynced => 2,
            Self::BranchCreated => 3,
            Self::PrOpened => 4,
            Self::Completed | Self::Failed => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortingRequest {
    pub request_uuid: String,
    pub launchpad_url: String,
}

impl PortingRequest {
    pub fn workflow_id(&self) -> String {
        format!("launchpad-to-github-{}", self.request_uuid)
    }

    pub fn child_workflow_id(&self) -> String {
        format!("internal-launchpad-to-github-{}", self.request_uuid)
    }
}

#[derive(Debug, Clone)]
pub struct PortingSagaSettings {
    /// Bounds every step up to and including opening the pull request.
    pub execution_timeout: Duration,
    pub activity_timeout: Duration,
    pub heartbeat_timeout: Duration,
    /// Retrieval, fork sync and branch creation.
    pub retry: RetryPolicy,
    pub pull_request_retry: RetryPolicy,
    pub complete_retry: RetryPolicy,
}

impl Default for PortingSagaSettings {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(15 * 60),
            activity_timeout: Duration::from_secs(300),
            heartbeat_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            pull_request_retry: RetryPolicy::side_effecting(),
            complete_retry: RetryPolicy::default(),
        }
    }
}

impl PortingSagaSettings {
    fn options(&self, retry: &RetryPolicy) -> ActivityOptions {
        ActivityOptions::new(self.activity_timeout)
            .with_heartbeat_timeout(self.heartbeat_timeout)
            .with_retry_policy(retry.clone())
    }
}

/// The porting steps, up to an opened pull request. Returns its URL.
pub struct PortProposalWorkflow {
    settings: PortingSagaSettings,
}

impl PortProposalWorkflow {
    pub fn new(settings: PortingSagaSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Workflow for PortProposalWorkflow {
    const NAME: &'static str = "internal-launchpad-to-github-workflow";
    type Input = PortingRequest;
    type Output = String;

    async fn run(&self, ctx: WorkflowContext, request: PortingRequest) -> Result<String, WorkflowError> {
        let s = &self.settings;

        let proposal = ctx
            .execute_activity::<RetrieveMergeProposal>(request.launchpad_url.clone(), s.options(&s.retry))
            .await?;
        ctx.advance_phase(PortingPhase::DiffRetrieved).await?;

        ctx.execute_activity::<SyncFork>((), s.options(&s.retry)).await?;
        ctx.advance_phase(PortingPhase::ForkSynced).await?;

        let pr_input = PullRequestInput {
            request_uuid: request.request_uuid.clone(),
            proposal_id: proposal.id,
            registrant: proposal.registrant.clone(),
            source_branch: proposal.source_branch.clone(),
            commit_message: proposal.commit_message.clone(),
        };
        let merge = ctx
            .execute_activity::<CreatePullRequestBranch>(
                BranchRequest {
                    request_uuid: request.request_uuid.clone(),
                    proposal,
                },
                s.options(&s.retry),
            )
            .await?;
        ctx.advance_phase(PortingPhase::BranchCreated).await?;
        info!(request_uuid = %request.request_uuid, ?merge, "Pull request branch pushed");

        let url = ctx
            .execute_activity::<OpenPullRequest>(pr_input, s.options(&s.pull_request_retry))
            .await?;
        ctx.advance_phase(PortingPhase::PrOpened).await?;
        Ok(url)
    }
}

/// Runs the porting steps and records the terminal status whatever happens.
pub struct PortingSagaWorkflow {
    settings: PortingSagaSettings,
}

impl PortingSagaWorkflow {
    pub fn new(settings: PortingSagaSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Workflow for PortingSagaWorkflow {
    const NAME: &'static str = "launchpad-to-github-workflow";
    type Input = PortingRequest;
    type Output = WorkStatus;

    async fn run(&self, ctx: WorkflowContext, request: PortingRequest) -> Result<WorkStatus, WorkflowError> {
        ctx.advance_phase(PortingPhase::New).await?;

        let child = WorkflowOptions::new(request.child_workflow_id())
            .with_task_queue(ctx.task_queue())
            .with_retry_policy(RetryPolicy::no_retry())
            .with_execution_timeout(self.settings.execution_timeout);
        let (status, github_url, phase) = match ctx
            .execute_child_workflow::<PortProposalWorkflow>(request.clone(), child)
            .await
        {
            Ok(url) => (WorkStatus::Completed, Some(url), PortingPhase::Completed),
            Err(e) => {
                warn!(request_uuid = %request.request_uuid, error = %e, "Porting failed");
                (WorkStatus::Failed, None, PortingPhase::Failed)
            }
        };

        ctx.execute_activity::<CompleteRequest>(
            CompleteRequestInput {
                request_uuid: request.request_uuid.clone(),
                status,
                github_url,
            },
            self.settings.options(&self.settings.complete_retry),
        )
        .await?;
        ctx.advance_phase(phase).await?;
        Ok(status)
    }
}
