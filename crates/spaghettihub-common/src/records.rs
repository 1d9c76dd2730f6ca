use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::webhook::WorkflowConclusion;

/// Commit row assembled from push and CI-status deliveries.
///
/// Partial records are normal: the push and each package status arrive
/// through independent webhooks in no particular order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitRecord {
    pub id: i64,
    pub commit_sha: String,
    pub commit_message: Option<String>,
    pub committer_username: Option<String>,
    pub commit_date: Option<String>,
    pub continuous_delivery_test_deb_status: Option<WorkflowConclusion>,
    pub continuous_delivery_test_snap_status: Option<WorkflowConclusion>,
}

/// Package flavour a release-pipeline job reports on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CiPackage {
    Deb,
    Snap,
}

impl CiPackage {
    /// Map a release-pipeline job name to the package it tests.
    pub fn from_job_name(name: &str) -> Option<Self> {
        match name {
            "deb" => Some(Self::Deb),
            "snap" => Some(Self::Snap),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deb => "deb",
            Self::Snap => "snap",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStatus {
    New,
    Completed,
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::New)
    }
}

impl FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid work status: {}", s)),
        }
    }
}

/// A user's request to port one Launchpad merge proposal to GitHub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortingWorkRecord {
    pub id: i64,
    pub requested_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub request_uuid: String,
    pub status: WorkStatus,
    pub github_url: Option<String>,
    pub launchpad_url: String,
}
