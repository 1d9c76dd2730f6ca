//! Durable state of the workflow engine: instances, their step history and
//! the signals delivered to them.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use serde_json::Value;

use super::{Database, now_rfc3339};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            _ => Err(format!("Invalid instance status: {}", s)),
        }
    }
}

/// Everything needed to persist a freshly started instance.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Value,
    pub parent_id: Option<String>,
    pub root_id: String,
    pub deadline: Option<DateTime<Utc>>,
    /// Workflow-level retry policy, stored opaquely for recovery.
    pub retry_policy: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Value,
    pub parent_id: Option<String>,
    pub root_id: String,
    pub status: InstanceStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub phase: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub retry_policy: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
    pub closed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Activity,
    Child,
}

impl StepKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Activity => "activity",
            Self::Child => "child",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Completed,
    Failed,
}

/// One completed entry of a workflow's history.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub seq: u32,
    pub kind: StepKind,
    pub name: String,
    pub status: StepStatus,
    /// `None` for a successful step whose output was deliberately not stored.
    pub output: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedSignal {
    pub name: String,
    pub payload: Option<Value>,
}

const INSTANCE_COLUMNS: &str = "id, workflow_type, task_queue, input, parent_id, root_id, status, \
     result, error, phase, deadline, retry_policy, created_at, updated_at, closed_at";

fn parse_json(raw: Option<String>) -> Result<Option<Value>> {
    raw.map(|s| serde_json::from_str(&s).context("Corrupt JSON column"))
        .transpose()
}

fn parse_deadline(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .context("Corrupt deadline column")
    })
    .transpose()
}

struct InstanceRow {
    id: String,
    workflow_type: String,
    task_queue: String,
    input: String,
    parent_id: Option<String>,
    root_id: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    phase: Option<String>,
    deadline: Option<String>,
    retry_policy: Option<String>,
    created_at: String,
    updated_at: String,
    closed_at: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workflow_type: row.get(1)?,
            task_queue: row.get(2)?,
            input: row.get(3)?,
            parent_id: row.get(4)?,
            root_id: row.get(5)?,
            status: row.get(6)?,
            result: row.get(7)?,
            error: row.get(8)?,
            phase: row.get(9)?,
            deadline: row.get(10)?,
            retry_policy: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            closed_at: row.get(14)?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance> {
        Ok(WorkflowInstance {
            id: self.id,
            workflow_type: self.workflow_type,
            task_queue: self.task_queue,
            input: serde_json::from_str(&self.input).context("Corrupt workflow input")?,
            parent_id: self.parent_id,
            root_id: self.root_id,
            status: self.status.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            result: parse_json(self.result)?,
            error: self.error,
            phase: self.phase,
            deadline: parse_deadline(self.deadline)?,
            retry_policy: parse_json(self.retry_policy)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            closed_at: self.closed_at,
        })
    }
}

impl Database {
    /// Persist a new instance. Returns `false` when the id is already taken.
    pub fn insert_instance(&self, new: &NewInstance) -> Result<bool> {
        let now = now_rfc3339();
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO workflow_instances
                    (id, workflow_type, task_queue, input, parent_id, root_id, deadline, retry_policy,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    new.id,
                    new.workflow_type,
                    new.task_queue,
                    new.input.to_string(),
                    new.parent_id,
                    new.root_id,
                    new.deadline.map(|d| d.to_rfc3339()),
                    new.retry_policy.as_ref().map(|v| v.to_string()),
                    now
                ],
            )
            .context("Failed to insert workflow instance")?;
        Ok(changed == 1)
    }

    pub fn get_instance(&self, id: &str) -> Result<Option<WorkflowInstance>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM workflow_instances WHERE id = ?1",
                    INSTANCE_COLUMNS
                ),
                params![id],
                InstanceRow::from_row,
            )
            .optional()
            .context("Failed to load workflow instance")?;
        row.map(InstanceRow::into_instance).transpose()
    }

    /// Running instances without a parent; children are re-driven by
    /// their parent's replay.
    pub fn running_root_instances(&self) -> Result<Vec<WorkflowInstance>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM workflow_instances
             WHERE status = 'running' AND parent_id IS NULL
             ORDER BY created_at",
            INSTANCE_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], InstanceRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list running instances")?;
        rows.into_iter().map(InstanceRow::into_instance).collect()
    }

    pub fn close_instance(
        &self,
        id: &str,
        status: InstanceStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> Result<()> {
        let now = now_rfc3339();
        self.conn
            .execute(
                "UPDATE workflow_instances
                 SET status = ?2, result = ?3, error = ?4, updated_at = ?5, closed_at = ?5
                 WHERE id = ?1",
                params![id, status.as_str(), result.map(|v| v.to_string()), error, now],
            )
            .context("Failed to close workflow instance")?;
        Ok(())
    }

    /// Forget the step history of an instance before a fresh attempt.
    /// Received signals are kept.
    pub fn reset_history(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM workflow_steps WHERE workflow_id = ?1",
                params![id],
            )
            .context("Failed to reset workflow history")?;
        Ok(())
    }

    /// Close children left running by a parent that stopped driving them.
    pub fn fail_running_children(&self, parent_id: &str, message: &str) -> Result<usize> {
        let now = now_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE workflow_instances
                 SET status = 'failed', error = ?2, updated_at = ?3, closed_at = ?3
                 WHERE parent_id = ?1 AND status = 'running'",
                params![parent_id, message, now],
            )
            .context("Failed to close orphaned children")?;
        Ok(changed)
    }

    /// Move the saga phase forward. A phase whose rank is not above the
    /// recorded one is ignored, so phases never regress.
    pub fn advance_phase(&self, root_id: &str, phase: &str, rank: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE workflow_instances SET phase = ?2, phase_rank = ?3, updated_at = ?4
                 WHERE id = ?1 AND phase_rank < ?3",
                params![root_id, phase, rank, now_rfc3339()],
            )
            .context("Failed to advance workflow phase")?;
        Ok(changed == 1)
    }

    pub fn get_step(&self, workflow_id: &str, seq: u32) -> Result<Option<StepRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT seq, kind, name, status, output, error, attempts
                 FROM workflow_steps WHERE workflow_id = ?1 AND seq = ?2",
                params![workflow_id, seq],
                |r| {
                    Ok((
                        r.get::<_, u32>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, Option<String>>(4)?,
                        r.get::<_, Option<String>>(5)?,
                        r.get::<_, u32>(6)?,
                    ))
                },
            )
            .optional()
            .context("Failed to load workflow step")?;

        let Some((seq, kind, name, status, output, error, attempts)) = row else {
            return Ok(None);
        };
        let kind = match kind.as_str() {
            "activity" => StepKind::Activity,
            "child" => StepKind::Child,
            other => anyhow::bail!("Invalid step kind: {}", other),
        };
        let status = match status.as_str() {
            "completed" => StepStatus::Completed,
            "failed" => StepStatus::Failed,
            other => anyhow::bail!("Invalid step status: {}", other),
        };
        Ok(Some(StepRecord {
            seq,
            kind,
            name,
            status,
            output: parse_json(output)?,
            error,
            attempts,
        }))
    }

    pub fn record_step(&self, workflow_id: &str, step: &StepRecord) -> Result<()> {
        let status = match step.status {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        };
        self.conn
            .execute(
                "INSERT OR REPLACE INTO workflow_steps
                    (workflow_id, seq, kind, name, status, output, error, attempts, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    workflow_id,
                    step.seq,
                    step.kind.as_str(),
                    step.name,
                    status,
                    step.output.as_ref().map(|v| v.to_string()),
                    step.error,
                    step.attempts,
                    now_rfc3339()
                ],
            )
            .context("Failed to record workflow step")?;
        Ok(())
    }

    pub fn insert_signal(&self, workflow_id: &str, name: &str, payload: Option<&Value>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO workflow_signals (workflow_id, name, payload, received_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![workflow_id, name, payload.map(|v| v.to_string()), now_rfc3339()],
            )
            .context("Failed to record signal")?;
        Ok(())
    }

    pub fn signals_for(&self, workflow_id: &str) -> Result<Vec<ReceivedSignal>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, payload FROM workflow_signals WHERE workflow_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![workflow_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load signals")?;
        rows.into_iter()
            .map(|(name, payload)| {
                Ok(ReceivedSignal {
                    name,
                    payload: parse_json(payload)?,
                })
            })
            .collect()
    }
}
