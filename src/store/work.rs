use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};
use spaghettihub_common::{PortingWorkRecord, WorkStatus};

use super::{Database, now_rfc3339};

const WORK_COLUMNS: &str =
    "id, requested_at, updated_at, completed_at, request_uuid, status, github_url, launchpad_url";

struct WorkRow {
    id: i64,
    requested_at: String,
    updated_at: String,
    completed_at: Option<String>,
    request_uuid: String,
    status: String,
    github_url: Option<String>,
    launchpad_url: String,
}

impl WorkRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            requested_at: row.get(1)?,
            updated_at: row.get(2)?,
            completed_at: row.get(3)?,
            request_uuid: row.get(4)?,
            status: row.get(5)?,
            github_url: row.get(6)?,
            launchpad_url: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<PortingWorkRecord> {
        Ok(PortingWorkRecord {
            id: self.id,
            requested_at: self.requested_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            request_uuid: self.request_uuid,
            status: self
                .status
                .parse::<WorkStatus>()
                .map_err(|e| anyhow::anyhow!(e))?,
            github_url: self.github_url,
            launchpad_url: self.launchpad_url,
        })
    }
}

impl Database {
    pub fn create_work(&self, request_uuid: &str, launchpad_url: &str) -> Result<PortingWorkRecord> {
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO porting_work (request_uuid, launchpad_url, status, requested_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![request_uuid, launchpad_url, WorkStatus::New.as_str(), now],
            )
            .context("Failed to insert porting work")?;
        self.get_work(request_uuid)?
            .ok_or_else(|| anyhow::anyhow!("Porting work {} vanished after insert", request_uuid))
    }

    pub fn get_work(&self, request_uuid: &str) -> Result<Option<PortingWorkRecord>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM porting_work WHERE request_uuid = ?1",
                    WORK_COLUMNS
                ),
                params![request_uuid],
                WorkRow::from_row,
            )
            .optional()
            .context("Failed to load porting work")?;
        row.map(WorkRow::into_record).transpose()
    }

    /// Record the terminal state of a porting request. Addressed by the
    /// unique request id, so repeating it is harmless.
    pub fn finish_work(
        &self,
        request_uuid: &str,
        status: WorkStatus,
        github_url: Option<&str>,
    ) -> Result<PortingWorkRecord> {
        let now = now_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE porting_work
                 SET status = ?2, github_url = ?3, completed_at = ?4, updated_at = ?4
                 WHERE request_uuid = ?1",
                params![request_uuid, status.as_str(), github_url, now],
            )
            .context("Failed to update porting work")?;
        if changed == 0 {
            anyhow::bail!("Porting work {} not found", request_uuid);
        }
        self.get_work(request_uuid)?
            .ok_or_else(|| anyhow::anyhow!("Porting work {} not found", request_uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_work_starts_new() -> Result<()> {
        let db = Database::open_in_memory()?;
        let work = db.create_work("uuid-1", "https://code.launchpad.net/~a/b/+git/c/+merge/1")?;
        assert_eq!(work.status, WorkStatus::New);
        assert!(work.github_url.is_none());
        assert!(work.completed_at.is_none());
        assert_eq!(work.requested_at, work.updated_at);
        Ok(())
    }

    #[test]
    fn test_request_uuid_is_unique() -> Result<()> {
        let db = Database::open_in_memory()?;
        db.create_work("dup", "u")?;
        assert!(db.create_work("dup", "u").is_err());
        Ok(())
    }

    #[test]
    fn test_finish_work_completed() -> Result<()> {
        let db = Database::open_in_memory()?;
        db.create_work("uuid-2", "u")?;
        let work = db.finish_work("uuid-2", WorkStatus::Completed, Some("https://github.com/o/r/pull/1"))?;
        assert_eq!(work.status, WorkStatus::Completed);
        assert_eq!(work.github_url.as_deref(), Some("https://github.com/o/r/pull/1"));
        assert!(work.completed_at.is_some());
        Ok(())
    }

    #[test]
    fn test_finish_work_failed_leaves_url_null() -> Result<()> {
        let db = Database::open_in_memory()?;
        db.create_work("uuid-3", "u")?;
        let work = db.finish_work("uuid-3", WorkStatus::Failed, None)?;
        assert_eq!(work.status, WorkStatus::Failed);
        assert!(work.github_url.is_none());
        Ok(())
    }

    #[test]
    fn test_finish_unknown_work_errors() -> Result<()> {
        let db = Database::open_in_memory()?;
        let err = db.finish_work("missing", WorkStatus::Failed, None).unwrap_err();
        assert!(err.to_string().contains("not found"));
        Ok(())
    }
}
