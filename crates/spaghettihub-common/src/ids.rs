use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const INNER_PREFIX: &str = "internal-runner-";
const OUTER_PREFIX: &str = "github-runner-";
const VM_PREFIX: &str = "runner-";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not a runner saga id")]
pub struct InvalidSagaId(pub String);

/// Correlation key of one runner provisioning saga.
///
/// Every name derived from a job id goes through this type: the VM name, the
/// runner name the agent registers with, and the workflow ids the signal is
/// addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunnerSagaId(i64);

impl RunnerSagaId {
    pub fn new(run_id: i64) -> Self {
        Self(run_id)
    }

    pub fn run_id(&self) -> i64 {
        self.0
    }

    /// Id of the provisioning workflow that waits for the `completed` signal.
    pub fn workflow_id(&self) -> String {
        format!("{}{}", INNER_PREFIX, self.0)
    }

    /// Id of the outer workflow owning teardown.
    pub fn outer_workflow_id(&self) -> String {
        format!("{}{}", OUTER_PREFIX, self.0)
    }

    /// Name of the VM and of the registered runner agent.
    pub fn vm_name(&self) -> String {
        format!("{}{}", VM_PREFIX, self.0)
    }
}

impl fmt::Display for RunnerSagaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.workflow_id())
    }
}

impl FromStr for RunnerSagaId {
    type Err = InvalidSagaId;

    /// Accepts `internal-runner-<n>`, `runner-<n>` or a bare `<n>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix(INNER_PREFIX)
            .or_else(|| trimmed.strip_prefix(VM_PREFIX))
            .unwrap_or(trimmed);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidSagaId(s.to_string()));
        }
        digits
            .parse::<i64>()
            .map(Self)
            .map_err(|_| InvalidSagaId(s.to_string()))
    }
}
