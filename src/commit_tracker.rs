//! Field-wise merging of commit facts from independent webhook deliveries.
//!
//! Push events own the message/author/date columns; release-pipeline job
//! events own one status column each. Every write is an upsert of only the
//! owned columns, so deliveries may repeat and arrive in any order.

use anyhow::Result;
use chrono::Utc;
use spaghettihub_common::{CiPackage, PushEvent, WorkflowJob, WorkflowJobEvent};
use tracing::{debug, info, warn};

use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerSettings {
    /// Only pushes to this branch are recorded.
    pub mainline_branch: String,
    /// Workflow name of the release pipeline whose jobs report statuses.
    pub pipeline_workflow: String,
    pub pipeline_branch: String,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            mainline_branch: "master".to_string(),
            pipeline_workflow: "Continuous delivery pipeline".to_string(),
            pipeline_branch: "master".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    Created,
    Updated,
    Ignored,
}

impl TrackOutcome {
    fn from_existed(existed: bool) -> Self {
        if existed { Self::Updated } else { Self::Created }
    }
}

#[derive(Clone)]
pub struct CommitTracker {
    store: Store,
    settings: TrackerSettings,
}

impl CommitTracker {
    pub fn new(store: Store, settings: TrackerSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// Whether a job belongs to the release pipeline on the tracked branch.
    pub fn is_release_pipeline_job(&self, job: &WorkflowJob) -> bool {
        job.workflow_name.as_deref() == Some(self.settings.pipeline_workflow.as_str())
            && job.head_branch.as_deref() == Some(self.settings.pipeline_branch.as_str())
    }

    /// Record message, author and date of the head commit of a mainline push.
    pub async fn record_push(&self, event: &PushEvent) -> Result<TrackOutcome> {
        let mainline = format!("refs/heads/{}", self.settings.mainline_branch);
        if event.git_ref != mainline {
            debug!(git_ref = %event.git_ref, "Ignoring push outside the mainline branch");
            return Ok(TrackOutcome::Ignored);
        }
        let Some(head) = event.head_commit.clone() else {
            debug!("Ignoring push without a head commit");
            return Ok(TrackOutcome::Ignored);
        };

        let sha = head.id.clone();
        // Stored in UTC so the text column sorts chronologically.
        let date = head.timestamp.with_timezone(&Utc).to_rfc3339();
        let existed = self
            .store
            .call(move |db| {
                db.upsert_commit_metadata(
                    &head.id,
                    &head.message,
                    head.author.username.as_deref(),
                    &date,
                )
            })
            .await?;

        info!(sha = %sha, existed, "Recorded commit metadata");
        Ok(TrackOutcome::from_existed(existed))
    }

    /// Record the conclusion of a deb or snap release-pipeline job.
    pub async fn record_job_status(&self, event: &WorkflowJobEvent) -> Result<TrackOutcome> {
        let job = &event.workflow_job;
        if !self.is_release_pipeline_job(job) {
            return Ok(TrackOutcome::Ignored);
        }
        let Some(package) = CiPackage::from_job_name(&job.name) else {
            debug!(job = %job.name, "Ignoring job that reports no package status");
            return Ok(TrackOutcome::Ignored);
        };
        let Some(conclusion) = job.conclusion else {
            return Ok(TrackOutcome::Ignored);
        };

        let sha = job.head_sha.clone();
        let key = sha.clone();
        let existed = self
            .store
            .call(move |db| db.upsert_commit_status(&key, package, conclusion))
            .await?;

        if !existed {
            warn!(sha = %sha, package = package.as_str(), "Status arrived before the push; created bare commit row");
        }
        info!(sha = %sha, package = package.as_str(), conclusion = conclusion.as_str(), "Recorded CI status");
        Ok(TrackOutcome::from_existed(existed))
    }
}
