use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use spaghettihub_common::{CiPackage, CommitRecord, WorkflowConclusion};

use super::{Database, now_rfc3339};

#[derive(Debug, Clone, Serialize)]
pub struct CommitPage {
    pub items: Vec<CommitRecord>,
    pub total: i64,
    pub page: u32,
    pub size: u32,
}

const COMMIT_COLUMNS: &str = "id, commit_sha, commit_message, committer_username, commit_date, \
     continuous_delivery_test_deb_status, continuous_delivery_test_snap_status";

fn status_column(package: CiPackage) -> &'static str {
    match package {
        CiPackage::Deb => "continuous_delivery_test_deb_status",
        CiPackage::Snap => "continuous_delivery_test_snap_status",
    }
}

fn parse_conclusion(raw: Option<String>) -> Result<Option<WorkflowConclusion>> {
    raw.map(|s| s.parse::<WorkflowConclusion>().map_err(|e| anyhow::anyhow!(e)))
        .transpose()
}

struct CommitRow {
    id: i64,
    commit_sha: String,
    commit_message: Option<String>,
    committer_username: Option<String>,
    commit_date: Option<String>,
    deb_status: Option<String>,
    snap_status: Option<String>,
}

impl CommitRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            commit_sha: row.get(1)?,
            commit_message: row.get(2)?,
            committer_username: row.get(3)?,
            commit_date: row.get(4)?,
            deb_status: row.get(5)?,
            snap_status: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<CommitRecord> {
        Ok(CommitRecord {
            id: self.id,
            commit_sha: self.commit_sha,
            commit_message: self.commit_message,
            committer_username: self.committer_username,
            commit_date: self.commit_date,
            continuous_delivery_test_deb_status: parse_conclusion(self.deb_status)?,
            continuous_delivery_test_snap_status: parse_conclusion(self.snap_status)?,
        })
    }
}

impl Database {
    pub fn get_commit(&self, commit_sha: &str) -> Result<Option<CommitRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM commits WHERE commit_sha = ?1", COMMIT_COLUMNS),
                params![commit_sha],
                CommitRow::from_row,
            )
            .optional()
            .context("Failed to load commit")?;
        row.map(CommitRow::into_record).transpose()
    }

    /// Insert or update only the push-owned fields of a commit row.
    /// Returns whether the row existed beforehand.
    pub fn upsert_commit_metadata(
        &self,
        commit_sha: &str,
        message: &str,
        committer_username: Option<&str>,
        commit_date: &str,
    ) -> Result<bool> {
        let existed = self.commit_exists(commit_sha)?;
        self.conn
            .execute(
                "INSERT INTO commits (commit_sha, commit_message, committer_username, commit_date)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(commit_sha) DO UPDATE SET
                    commit_message = excluded.commit_message,
                    committer_username = excluded.committer_username,
                    commit_date = excluded.commit_date,
                    updated_at = ?5",
                params![commit_sha, message, committer_username, commit_date, now_rfc3339()],
            )
            .context("Failed to upsert commit metadata")?;
        Ok(existed)
    }

    /// Insert or update exactly one package status column of a commit row.
    /// Returns whether the row existed beforehand.
    pub fn upsert_commit_status(
        &self,
        commit_sha: &str,
        package: CiPackage,
        conclusion: WorkflowConclusion,
    ) -> Result<bool> {
        let existed = self.commit_exists(commit_sha)?;
        let column = status_column(package);
        self.conn
            .execute(
                &format!(
                    "INSERT INTO commits (commit_sha, {col}) VALUES (?1, ?2)
                     ON CONFLICT(commit_sha) DO UPDATE SET {col} = excluded.{col}, updated_at = ?3",
                    col = column
                ),
                params![commit_sha, conclusion.as_str(), now_rfc3339()],
            )
            .context("Failed to upsert commit status")?;
        Ok(existed)
    }

    fn commit_exists(&self, commit_sha: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM commits WHERE commit_sha = ?1",
                params![commit_sha],
                |r| r.get(0),
            )
            .optional()
            .context("Failed to look up commit")?;
        Ok(found.is_some())
    }

    /// Page through commits, newest first, optionally filtered by a
    /// substring of the commit message.
    pub fn list_commits(&self, query: Option<&str>, page: u32, size: u32) -> Result<CommitPage> {
        let size = size.clamp(1, 200);
        let offset = i64::from(page) * i64::from(size);
        let pattern = query
            .filter(|q| !q.trim().is_empty())
            .map(|q| format!("%{}%", q.trim()));

        let total: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM commits WHERE ?1 IS NULL OR commit_message LIKE ?1",
                params![pattern],
                |r| r.get(0),
            )
            .context("Failed to count commits")?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM commits
             WHERE ?1 IS NULL OR commit_message LIKE ?1
             ORDER BY commit_date IS NULL, commit_date DESC, id DESC
             LIMIT ?2 OFFSET ?3",
            COMMIT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![pattern, i64::from(size), offset], CommitRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list commits")?;
        let items = rows
            .into_iter()
            .map(CommitRow::into_record)
            .collect::<Result<Vec<_>>>()?;

        Ok(CommitPage {
            items,
            total,
            page,
            size,
        })
    }
}
