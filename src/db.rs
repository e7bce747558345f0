use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::jobs::models::{GenerationJob, JobStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub github_repo: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredFile {
    pub id: i64,
    pub generation_id: String,
    pub project_id: i64,
    pub filename: String,
    pub storage_path: String,
    pub content: String,
    pub content_sha256: String,
    pub created_at: String,
}

/// A file about to be recorded for a generation.
#[derive(Debug, Clone)]
pub struct NewStoredFile {
    pub filename: String,
    pub storage_path: String,
    pub content: String,
}

/// How a generation names the project it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectRef {
    /// Must already exist
    Id(i64),
    /// Created on first use
    Name(String),
}

/// Async-safe handle to the application database.
///
/// Wraps `AppDb` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, so synchronous SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<AppDb>>,
}

impl DbHandle {
    pub fn new(db: AppDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&AppDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct AppDb {
    conn: Connection,
}

fn timestamp(dt: DateTime<Utc>) -> String {
    // Fixed width so lexical order matches time order.
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn sha256_hex(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

impl AppDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
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
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    github_repo TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS stored_files (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    generation_id TEXT NOT NULL,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    filename TEXT NOT NULL,
                    storage_path TEXT NOT NULL,
                    content TEXT NOT NULL,
                    content_sha256 TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(generation_id, filename)
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    completed_at TEXT,
                    payload TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_stored_files_project ON stored_files(project_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, name: &str) -> Result<Project> {
        self.conn
            .execute("INSERT INTO projects (name) VALUES (?1)", params![name])
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?.context("Project not found after insert")
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, github_repo, created_at FROM projects ORDER BY id")
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], project_from_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, github_repo, created_at FROM projects WHERE id = ?1",
                params![id],
                project_from_row,
            )
            .optional()
            .context("Failed to query project")
    }

    pub fn get_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, github_repo, created_at FROM projects WHERE name = ?1",
                params![name],
                project_from_row,
            )
            .optional()
            .context("Failed to query project by name")
    }

    pub fn update_project_github_repo(&self, id: i64, github_repo: &str) -> Result<Project> {
        self.conn
            .execute(
                "UPDATE projects SET github_repo = ?1 WHERE id = ?2",
                params![github_repo, id],
            )
            .context("Failed to update project github_repo")?;
        self.get_project(id)?
            .context("Project not found after github_repo update")
    }

    // ── Stored files ──────────────────────────────────────────────────

    /// Resolve the project and record every file of one generation in a
    /// single transaction. Nothing is written if any step fails.
    pub fn record_generation(
        &self,
        project: &ProjectRef,
        generation_id: Uuid,
        files: &[NewStoredFile],
    ) -> Result<(Project, Vec<StoredFile>)> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let project_id = match project {
            ProjectRef::Id(id) => match self.get_project(*id)? {
                Some(p) => p.id,
                None => bail!("Project {} not found", id),
            },
            ProjectRef::Name(name) => match self.get_project_by_name(name)? {
                Some(p) => p.id,
                None => self.create_project(name)?.id,
            },
        };

        let generation = generation_id.to_string();
        for file in files {
            self.conn
                .execute(
                    "INSERT INTO stored_files
                        (generation_id, project_id, filename, storage_path, content, content_sha256)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        generation,
                        project_id,
                        file.filename,
                        file.storage_path,
                        file.content,
                        sha256_hex(&file.content)
                    ],
                )
                .with_context(|| format!("Failed to insert stored file {}", file.filename))?;
        }
        tx.commit().context("Failed to commit generation")?;

        let project = self
            .get_project(project_id)?
            .context("Project not found after commit")?;
        let stored = self.list_files_for_generation(&generation)?;
        Ok((project, stored))
    }

    pub fn list_files_for_project(&self, project_id: i64) -> Result<Vec<StoredFile>> {
        self.query_files(
            "SELECT id, generation_id, project_id, filename, storage_path, content, content_sha256, created_at
             FROM stored_files WHERE project_id = ?1 ORDER BY id",
            params![project_id],
        )
    }

    pub fn list_files_for_generation(&self, generation_id: &str) -> Result<Vec<StoredFile>> {
        self.query_files(
            "SELECT id, generation_id, project_id, filename, storage_path, content, content_sha256, created_at
             FROM stored_files WHERE generation_id = ?1 ORDER BY filename",
            params![generation_id],
        )
    }

    fn query_files(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<StoredFile>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare file query")?;
        let rows = stmt
            .query_map(args, |row| {
                Ok(StoredFile {
                    id: row.get(0)?,
                    generation_id: row.get(1)?,
                    project_id: row.get(2)?,
                    filename: row.get(3)?,
                    storage_path: row.get(4)?,
                    content: row.get(5)?,
                    content_sha256: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .context("Failed to query stored files")?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row.context("Failed to read stored file row")?);
        }
        Ok(files)
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn upsert_job(&self, job: &GenerationJob) -> Result<()> {
        let payload = serde_json::to_string(job).context("Failed to serialize job")?;
        self.conn
            .execute(
                "INSERT INTO jobs (id, status, created_at, completed_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    completed_at = excluded.completed_at,
                    payload = excluded.payload",
                params![
                    job.job_id.to_string(),
                    job.status.as_str(),
                    timestamp(job.created_at),
                    job.completed_at.map(timestamp),
                    payload
                ],
            )
            .context("Failed to upsert job")?;
        Ok(())
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<GenerationJob>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM jobs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query job")?;
        payload
            .map(|p| serde_json::from_str(&p).context("Failed to parse job payload"))
            .transpose()
    }

    /// Jobs newest first, optionally filtered by status.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<GenerationJob>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT payload FROM jobs
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC",
            )
            .context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], |row| row.get::<_, String>(0))
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            let payload = row.context("Failed to read job row")?;
            jobs.push(serde_json::from_str(&payload).context("Failed to parse job payload")?);
        }
        Ok(jobs)
    }

    pub fn delete_finished_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM jobs
                 WHERE status IN ('completed', 'failed', 'cancelled')
                   AND completed_at IS NOT NULL
                   AND completed_at < ?1",
                params![timestamp(cutoff)],
            )
            .context("Failed to delete finished jobs")
    }

    /// Mark jobs left pending or running by a previous process as failed.
    pub fn fail_interrupted_jobs(&self, message: &str) -> Result<usize> {
        let mut count = 0;
        for status in [JobStatus::Pending, JobStatus::Running] {
            for mut job in self.list_jobs(Some(status))? {
                job.fail(message).map_err(|e| anyhow::anyhow!(e))?;
                self.upsert_job(&job)?;
                count += 1;
            }
        }
        Ok(count)
    }
}

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        github_repo: row.get(2)?,
        created_at: row.get(3)?,
    })
}

impl FromStr for ProjectRef {
    type Err = std::convert::Infallible;

    /// Numeric strings are ids, anything else is a name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<i64>() {
            Ok(id) => ProjectRef::Id(id),
            Err(_) => ProjectRef::Name(s.to_string()),
        })
    }
}
