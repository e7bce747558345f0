//! Job storage backends.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::{GenerationJob, JobStatus};
use crate::db::DbHandle;
use crate::errors::JobError;

/// Mutation applied to a stored job under the store's lock.
pub type JobUpdate = Box<dyn FnOnce(&mut GenerationJob) -> Result<(), JobError> + Send>;

pub const INTERRUPTED_MESSAGE: &str = "Interrupted by restart";

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<GenerationJob>, JobError>;

    async fn put(&self, job: GenerationJob) -> Result<(), JobError>;

    /// Apply `update` atomically. If it returns an error the stored job is
    /// left as it was.
    async fn update(&self, id: Uuid, update: JobUpdate) -> Result<GenerationJob, JobError>;

    /// Newest first.
    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<GenerationJob>, JobError>;

    /// Remove terminal jobs that completed before `cutoff`.
    async fn remove_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, JobError>;
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, GenerationJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, id: Uuid) -> Result<Option<GenerationJob>, JobError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn put(&self, job: GenerationJob) -> Result<(), JobError> {
        self.jobs.lock().await.insert(job.job_id, job);
        Ok(())
    }

    async fn update(&self, id: Uuid, update: JobUpdate) -> Result<GenerationJob, JobError> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs.get_mut(&id).ok_or(JobError::NotFound { id })?;
        let mut next = stored.clone();
        update(&mut next)?;
        *stored = next.clone();
        Ok(next)
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<GenerationJob>, JobError> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<GenerationJob> = jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn remove_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, JobError> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.is_some_and(|done| done < cutoff))
        });
        Ok(before - jobs.len())
    }
}

/// Jobs kept in the application database so they survive restarts.
pub struct SqliteJobStore {
    db: DbHandle,
}

impl SqliteJobStore {
    /// Open the store, failing any job a previous process left unfinished.
    pub async fn open(db: DbHandle) -> Result<Self, JobError> {
        let interrupted = db
            .call(|db| db.fail_interrupted_jobs(INTERRUPTED_MESSAGE))
            .await
            .map_err(JobError::Store)?;
        if interrupted > 0 {
            warn!(count = interrupted, "Marked interrupted jobs as failed");
        } else {
            info!("Job store ready");
        }
        Ok(Self { db })
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn get(&self, id: Uuid) -> Result<Option<GenerationJob>, JobError> {
        self.db
            .call(move |db| db.get_job(id))
            .await
            .map_err(JobError::Store)
    }

    async fn put(&self, job: GenerationJob) -> Result<(), JobError> {
        self.db
            .call(move |db| db.upsert_job(&job))
            .await
            .map_err(JobError::Store)
    }

    async fn update(&self, id: Uuid, update: JobUpdate) -> Result<GenerationJob, JobError> {
        // The handle's lock is held for the whole closure, so read-modify-write
        // is atomic with respect to other callers.
        self.db
            .call(move |db| {
                let Some(mut job) = db.get_job(id)? else {
                    return Ok(Err(JobError::NotFound { id }));
                };
                if let Err(e) = update(&mut job) {
                    return Ok(Err(e));
                }
                db.upsert_job(&job)?;
                Ok(Ok(job))
            })
            .await
            .map_err(JobError::Store)?
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<GenerationJob>, JobError> {
        self.db
            .call(move |db| db.list_jobs(status))
            .await
            .map_err(JobError::Store)
    }

    async fn remove_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, JobError> {
        self.db
            .call(move |db| db.delete_finished_jobs_before(cutoff))
            .await
            .map_err(JobError::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AppDb;
    use crate::generate::models::{GenerationRequest, Scenario};
    use std::sync::Arc;

    fn job() -> GenerationJob {
        GenerationJob::new(Arc::new(GenerationRequest::new("vpc", Scenario::NewResource)))
    }

    async fn exercise(store: &dyn JobStore) {
        let mut older = job();
        older.created_at -= chrono::Duration::seconds(10);
        let newer = job();
        store.put(older.clone()).await.unwrap();
        store.put(newer.clone()).await.unwrap();

        let listed = store.list(None).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].job_id, newer.job_id);

        let updated = store
            .update(older.job_id, Box::new(|j| j.transition(JobStatus::Running)))
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Running);
        assert_eq!(store.list(Some(JobStatus::Running)).await.unwrap().len(), 1);

        // A rejected update leaves the job untouched.
        let err = store
            .update(older.job_id, Box::new(|j| j.transition(JobStatus::Pending)))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        let current = store.get(older.job_id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Running);

        let missing = Uuid::new_v4();
        assert!(matches!(
            store.update(missing, Box::new(|_| Ok(()))).await,
            Err(JobError::NotFound { id }) if id == missing
        ));
        assert!(store.get(missing).await.unwrap().is_none());

        store
            .update(older.job_id, Box::new(|j| j.fail("boom")))
            .await
            .unwrap();
        assert_eq!(store.remove_finished_before(Utc::now() - chrono::Duration::hours(1)).await.unwrap(), 0);
        assert_eq!(store.remove_finished_before(Utc::now() + chrono::Duration::seconds(1)).await.unwrap(), 1);
        // Pending jobs are never removed.
        assert_eq!(store.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        exercise(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let db = DbHandle::new(AppDb::new_in_memory().unwrap());
        let store = SqliteJobStore::open(db).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_open_fails_interrupted_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tfgen.db");
        let running = {
            let mut j = job();
            j.transition(JobStatus::Running).unwrap();
            j
        };
        let id = running.job_id;
        {
            let db = DbHandle::new(AppDb::new(&path).unwrap());
            let store = SqliteJobStore::open(db).await.unwrap();
            store.put(running).await.unwrap();
        }

        let store = SqliteJobStore::open(DbHandle::new(AppDb::new(&path).unwrap()))
            .await
            .unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
    }
}
