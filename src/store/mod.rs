//! SQLite persistence for commit rows, porting work and durable workflow
//! state.
//!
//! `Database` owns the connection and exposes synchronous operations, split
//! by concern across `commits`, `work` and `workflows`. `Store` is the
//! async-safe handle everything else holds.

mod commits;
mod work;
mod workflows;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;

pub use commits::CommitPage;
pub use workflows::{
    InstanceStatus, NewInstance, ReceivedSignal, StepKind, StepRecord, StepStatus,
    WorkflowInstance,
};

/// Async-safe handle to the database.
///
/// Runs every access on tokio's blocking pool via `spawn_blocking` so
/// synchronous SQLite I/O never ties up async worker threads.
#[derive(Clone)]
pub struct Store {
    inner: Arc<std::sync::Mutex<Database>>,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Database) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For start-up, the CLI and
    /// tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Database>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS commits (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    commit_sha TEXT NOT NULL UNIQUE,
                    commit_message TEXT,
                    committer_username TEXT,
                    commit_date TEXT,
                    continuous_delivery_test_deb_status TEXT,
                    continuous_delivery_test_snap_status TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS porting_work (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    request_uuid TEXT NOT NULL UNIQUE,
                    launchpad_url TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'NEW',
                    github_url TEXT,
                    requested_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS workflow_instances (
                    id TEXT PRIMARY KEY,
                    workflow_type TEXT NOT NULL,
                    task_queue TEXT NOT NULL,
                    input TEXT NOT NULL,
                    parent_id TEXT REFERENCES workflow_instances(id),
                    root_id TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    result TEXT,
                    error TEXT,
                    phase TEXT,
                    phase_rank INTEGER NOT NULL DEFAULT -1,
                    deadline TEXT,
                    retry_policy TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    closed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS workflow_steps (
                    workflow_id TEXT NOT NULL REFERENCES workflow_instances(id),
                    seq INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    output TEXT,
                    error TEXT,
                    attempts INTEGER NOT NULL DEFAULT 1,
                    recorded_at TEXT NOT NULL,
                    PRIMARY KEY (workflow_id, seq)
                );

                CREATE TABLE IF NOT EXISTS workflow_signals (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    workflow_id TEXT NOT NULL REFERENCES workflow_instances(id),
                    name TEXT NOT NULL,
                    payload TEXT,
                    received_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_commits_date ON commits(commit_date);
                CREATE INDEX IF NOT EXISTS idx_instances_status ON workflow_instances(status, parent_id);
                CREATE INDEX IF NOT EXISTS idx_signals_workflow ON workflow_signals(workflow_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
