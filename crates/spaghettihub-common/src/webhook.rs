//! Typed GitHub webhook payloads.
//!
//! Only the fields the orchestration layer reads are modelled; everything
//! else in the payload is ignored during deserialization.

use std::str::FromStr;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Lifecycle action carried by a `workflow_job` delivery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    Queued,
    InProgress,
    Completed,
    Waiting,
}

impl WorkflowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Waiting => "waiting",
        }
    }
}

/// Final conclusion of a job, as reported by GitHub.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowConclusion {
    Success,
    Failure,
    Skipped,
    Cancelled,
    ActionRequired,
    Neutral,
    TimedOut,
    Stale,
}

impl WorkflowConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
            Self::ActionRequired => "action_required",
            Self::Neutral => "neutral",
            Self::TimedOut => "timed_out",
            Self::Stale => "stale",
        }
    }
}

impl FromStr for WorkflowConclusion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            "action_required" => Ok(Self::ActionRequired),
            "neutral" => Ok(Self::Neutral),
            "timed_out" => Ok(Self::TimedOut),
            "stale" => Ok(Self::Stale),
            _ => Err(format!("Invalid workflow conclusion: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowJob {
    /// Job id. This is the `run_id` a runner saga is keyed on.
    pub id: i64,
    #[serde(default)]
    pub run_id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub head_branch: Option<String>,
    pub head_sha: String,
    #[serde(default)]
    pub conclusion: Option<WorkflowConclusion>,
    pub run_url: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub runner_name: Option<String>,
}

impl WorkflowJob {
    pub fn is_self_hosted(&self) -> bool {
        self.labels.iter().any(|l| l == "self-hosted")
    }
}

/// Body of a `workflow_job` delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowJobEvent {
    pub action: WorkflowAction,
    pub workflow_job: WorkflowJob,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitAuthor {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Absent when the commit email is not linked to a GitHub account.
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushCommit {
    pub id: String,
    pub author: CommitAuthor,
    pub message: String,
    pub timestamp: DateTime<FixedOffset>,
}

/// Body of a `push` delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub commits: Vec<PushCommit>,
    /// Null when the push deleted the ref.
    pub head_commit: Option<PushCommit>,
}
