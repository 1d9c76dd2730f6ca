use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spaghettihub_common::WorkStatus;
use tracing::info;

use super::vcs::{MergeOutcome, Vcs};
use crate::clients::{GitHubApi, LaunchpadApi, MergeProposal, NewPullRequest};
use crate::engine::{Activity, ActivityContext};
use crate::errors::ActivityError;
use crate::store::Store;

const HEARTBEAT_EVERY: Duration = Duration::from_secs(10);

pub struct RetrieveMergeProposal {
    launchpad: Arc<dyn LaunchpadApi>,
}

impl RetrieveMergeProposal {
    pub fn new(launchpad: Arc<dyn LaunchpadApi>) -> Self {
        Self { launchpad }
    }
}

#[async_trait]
impl Activity for RetrieveMergeProposal {
    const NAME: &'static str = "retrieve-merge-proposal-from-launchpad";
    type Input = String;
    type Output = MergeProposal;

    async fn run(&self, ctx: ActivityContext, web_url: String) -> Result<MergeProposal, ActivityError> {
        ctx.heartbeat();
        let proposal = self.launchpad.fetch_merge_proposal(&web_url).await?;
        info!(
            proposal = proposal.id,
            registrant = %proposal.registrant,
            branch = %proposal.source_branch,
            diff_bytes = proposal.diff.len(),
            "Retrieved merge proposal"
        );
        Ok(proposal)
    }
}

pub struct SyncFork {
    vcs: Arc<dyn Vcs>,
}

impl SyncFork {
    pub fn new(vcs: Arc<dyn Vcs>) -> Self {
        Self { vcs }
    }
}

#[async_trait]
impl Activity for SyncFork {
    const NAME: &'static str = "update-github-fork-master-branch";
    type Input = ();
    type Output = ();

    async fn run(&self, ctx: ActivityContext, _input: ()) -> Result<(), ActivityError> {
        ctx.heartbeat_while(HEARTBEAT_EVERY, self.vcs.sync_fork()).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRequest {
    pub request_uuid: String,
    pub proposal: MergeProposal,
}

/// Builds the pull request branch: a clean merge when possible, otherwise
/// the proposal's diff applied on top of the base branch.
pub struct CreatePullRequestBranch {
    vcs: Arc<dyn Vcs>,
}

impl CreatePullRequestBranch {
    pub fn new(vcs: Arc<dyn Vcs>) -> Self {
        Self { vcs }
    }
}

pub fn patch_commit_message(proposal: &MergeProposal) -> String {
    match proposal.commit_message.as_deref().map(str::trim) {
        Some(message) if !message.is_empty() => message.to_string(),
        _ => format!(
            "Launchpad MP ({}) - {}/{}",
            proposal.id, proposal.registrant, proposal.source_branch
        ),
    }
}

#[async_trait]
impl Activity for CreatePullRequestBranch {
    const NAME: &'static str = "create-github-branch-for-pull-request";
    type Input = BranchRequest;
    type Output = MergeOutcome;

    async fn run(&self, ctx: ActivityContext, request: BranchRequest) -> Result<MergeOutcome, ActivityError> {
        let branch = &request.request_uuid;
        let proposal = &request.proposal;

        let outcome = ctx
            .heartbeat_while(
                HEARTBEAT_EVERY,
                self.vcs
                    .merge_proposal(branch, &proposal.source_repository, &proposal.source_branch),
            )
            .await?;

        if outcome == MergeOutcome::Conflicted {
            info!(request_uuid = %branch, "Merge conflicts, applying the proposal diff instead");
            let message = patch_commit_message(proposal);
            ctx.heartbeat_while(
                HEARTBEAT_EVERY,
                self.vcs.apply_patch(branch, &proposal.diff, &message),
            )
            .await?;
        }

        ctx.heartbeat_while(HEARTBEAT_EVERY, self.vcs.push_branch(branch))
            .await?;
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestInput {
    pub request_uuid: String,
    pub proposal_id: u64,
    pub registrant: String,
    pub source_branch: String,
    pub commit_message: Option<String>,
}

/// Where pull requests are opened from and to.
#[derive(Debug, Clone)]
pub struct PullRequestSettings {
    /// GitHub owner of the fork holding request branches.
    pub fork_owner: String,
    pub base_branch: String,
}

/// Opens the pull request. Not idempotent: every success creates a PR.
pub struct OpenPullRequest {
    github: Arc<dyn GitHubApi>,
    settings: PullRequestSettings,
}

impl OpenPullRequest {
    pub fn new(github: Arc<dyn GitHubApi>, settings: PullRequestSettings) -> Self {
        Self { github, settings }
    }

    pub fn pull_request_for(&self, input: &PullRequestInput) -> NewPullRequest {
        NewPullRequest {
            title: format!(
                "Launchpad MP ({}) - {}/{}",
                input.proposal_id, input.registrant, input.source_branch
            ),
            body: format!(
                "This is autogenerated by SpaghettiHub. Enjoy!\n\n\nCommit message: {}",
                input.commit_message.as_deref().unwrap_or_default()
            ),
            head: format!("{}:{}", self.settings.fork_owner, input.request_uuid),
            base: self.settings.base_branch.clone(),
        }
    }
}

#[async_trait]
impl Activity for OpenPullRequest {
    const NAME: &'static str = "create-github-pull-request";
    type Input = PullRequestInput;
    type Output = String;

    async fn run(&self, _ctx: ActivityContext, input: PullRequestInput) -> Result<String, ActivityError> {
        let pr = self.github.create_pull_request(&self.pull_request_for(&input)).await?;
        info!(request_uuid = %input.request_uuid, number = pr.number, url = %pr.html_url, "Opened pull request");
        Ok(pr.html_url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteRequestInput {
    pub request_uuid: String,
    pub status: WorkStatus,
    pub github_url: Option<String>,
}

/// Writes the terminal state of a porting request.
pub struct CompleteRequest {
    store: Store,
}

impl CompleteRequest {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Activity for CompleteRequest {
    const NAME: &'static str = "complete-request";
    type Input = CompleteRequestInput;
    type Output = ();

    async fn run(&self, _ctx: ActivityContext, input: CompleteRequestInput) -> Result<(), ActivityError> {
        let CompleteRequestInput {
            request_uuid,
            status,
            github_url,
        } = input;
        let work = self
            .store
            .call(move |db| db.finish_work(&request_uuid, status, github_url.as_deref()))
            .await?;
        info!(request_uuid = %work.request_uuid, status = work.status.as_str(), "Porting request finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(commit_message: Option<&str>) -> MergeProposal {
        MergeProposal {
            id: 451234,
            web_url: "https://code.launchpad.net/~jane/maas/+git/maas/+merge/451234".into(),
            registrant: "jane".into(),
            source_branch: "fix-dhcp".into(),
            source_repository: "https://git.launchpad.net/~jane/maas".into(),
            description: None,
            commit_message: commit_message.map(str::to_string),
            diff: String::new(),
        }
    }

    #[test]
    fn test_patch_commit_message_falls_back_to_title() {
        assert_eq!(patch_commit_message(&proposal(Some("Fix leases"))), "Fix leases");
        assert_eq!(
            patch_commit_message(&proposal(Some("  "))),
            "Launchpad MP (451234) - jane/fix-dhcp"
        );
        assert_eq!(
            patch_commit_message(&proposal(None)),
            "Launchpad MP (451234) - jane/fix-dhcp"
        );
    }

    struct NoGitHub;

    #[async_trait]
    impl GitHubApi for NoGitHub {
        async fn create_registration_token(&self) -> anyhow::Result<crate::clients::RegistrationToken> {
            anyhow::bail!("unused")
        }

        async fn create_pull_request(&self, _: &NewPullRequest) -> anyhow::Result<crate::clients::PullRequest> {
            anyhow::bail!("unused")
        }
    }

    #[test]
    fn test_pull_request_shape() {
        let activity = OpenPullRequest::new(
            Arc::new(NoGitHub),
            PullRequestSettings {
                fork_owner: "r00tabot".into(),
                base_branch: "master".into(),
            },
        );
        let pr = activity.pull_request_for(&PullRequestInput {
            request_uuid: "7d3c".into(),
            proposal_id: 451234,
            registrant: "jane".into(),
            source_branch: "fix-dhcp".into(),
            commit_message: Some("Fix leases".into()),
        });
        assert_eq!(pr.title, "Launchpad MP (451234) - jane/fix-dhcp");
        assert_eq!(pr.head, "r00tabot:7d3c");
        assert_eq!(pr.base, "master");
        assert!(pr.body.ends_with("Commit message: Fix leases"));
    }

    #[tokio::test]
    async fn test_complete_request_failed_leaves_url_unset() {
        let store = Store::open_in_memory().unwrap();
        store
            .call(|db| db.create_work("uuid-9", "https://code.launchpad.net/~a/b/+merge/1"))
            .await
            .unwrap();
        CompleteRequest::new(store.clone())
            .run(
                ActivityContext::standalone(CompleteRequest::NAME),
                CompleteRequestInput {
                    request_uuid: "uuid-9".into(),
                    status: WorkStatus::Failed,
                    github_url: None,
                },
            )
            .await
            .unwrap();
        let work = store.call(|db| db.get_work("uuid-9")).await.unwrap().unwrap();
        assert_eq!(work.status, WorkStatus::Failed);
        assert!(work.github_url.is_none());
        assert!(work.completed_at.is_some());
    }
}
