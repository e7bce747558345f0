//! Asynchronous generation jobs.
//!
//! [`JobManager::submit`] stores a pending job and returns at once; the
//! pipeline runs on a spawned task gated by a semaphore and bounded by a
//! per-job timeout. Each job carries a [`CancellationToken`] so `cancel` can
//! drop the in-flight pipeline future.

pub mod metrics;
pub mod models;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::JobsSection;
use crate::errors::JobError;
use crate::generate::clarify::{ClarificationHandler, PendingClarifications};
use crate::generate::models::{GenerationRequest, GenerationResult};
use crate::generate::pipeline::PipelineOrchestrator;

pub use metrics::{Metrics, MetricsSnapshot};
pub use models::{GenerationJob, JobSnapshot, JobStatus};
pub use store::{InMemoryJobStore, JobStore, SqliteJobStore};

pub const TIMEOUT_MESSAGE: &str = "Generation timed out";

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub max_concurrent: usize,
    pub timeout: Duration,
}

impl JobSettings {
    pub fn from_config(section: &JobsSection) -> Self {
        Self {
            max_concurrent: section.max_concurrent.max(1),
            timeout: Duration::from_secs(section.timeout_secs),
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self::from_config(&JobsSection::default())
    }
}

struct Inner {
    store: Arc<dyn JobStore>,
    pipeline: Arc<PipelineOrchestrator>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
    clarifications: Arc<PendingClarifications>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

enum Outcome {
    Finished(GenerationResult),
    TimedOut,
    Cancelled,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        pipeline: Arc<PipelineOrchestrator>,
        settings: JobSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                pipeline,
                semaphore: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
                timeout: settings.timeout,
                tokens: Mutex::new(HashMap::new()),
                clarifications: Arc::new(PendingClarifications::new()),
                metrics: Arc::new(Metrics::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn pipeline(&self) -> &PipelineOrchestrator {
        &self.inner.pipeline
    }

    /// Store a pending job and start it in the background.
    pub async fn submit(&self, request: GenerationRequest) -> Result<Uuid, JobError> {
        let request = Arc::new(request);
        let job = GenerationJob::new(request.clone());
        let job_id = job.job_id;
        self.inner.store.put(job).await?;

        let token = CancellationToken::new();
        self.inner.tokens.lock().await.insert(job_id, token.clone());
        self.inner.metrics.job_submitted();
        info!(%job_id, scenario = request.scenario.as_str(), "Job submitted");

        tokio::spawn(run_job(self.inner.clone(), job_id, request, token));
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<GenerationJob, JobError> {
        self.inner
            .store
            .get(job_id)
            .await?
            .ok_or(JobError::NotFound { id: job_id })
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<JobSnapshot, JobError> {
        Ok(self.get_job(job_id).await?.snapshot())
    }

    /// The job once it is terminal; `NotFinished` before that.
    pub async fn get_result(&self, job_id: Uuid) -> Result<GenerationJob, JobError> {
        let job = self.get_job(job_id).await?;
        if !job.status.is_terminal() {
            return Err(JobError::NotFinished {
                id: job_id,
                status: job.status,
            });
        }
        Ok(job)
    }

    /// Cancel a pending or running job. Returns false, changing nothing, when
    /// the job already finished.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, JobError> {
        let updated = self
            .inner
            .store
            .update(job_id, Box::new(|job| job.transition(JobStatus::Cancelled)))
            .await;
        match updated {
            Ok(_) => {
                if let Some(token) = self.inner.tokens.lock().await.get(&job_id) {
                    token.cancel();
                }
                self.inner.clarifications.forget(job_id).await;
                self.inner.metrics.job_cancelled();
                info!(%job_id, "Job cancelled");
                Ok(true)
            }
            Err(JobError::InvalidTransition { from, .. }) => {
                debug!(%job_id, status = %from, "Cancel ignored for finished job");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<JobSnapshot>, JobError> {
        Ok(self
            .inner
            .store
            .list(status)
            .await?
            .iter()
            .map(GenerationJob::snapshot)
            .collect())
    }

    /// Remove terminal jobs that finished more than `max_age` ago.
    pub async fn cleanup(&self, max_age: Duration) -> Result<usize, JobError> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = chrono::Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let removed = self.inner.store.remove_finished_before(cutoff).await?;
        if removed > 0 {
            info!(removed, "Cleaned up finished jobs");
        }
        Ok(removed)
    }

    /// Deliver an answer to a job waiting on clarification. Returns false when
    /// the job isn't waiting.
    pub async fn answer_clarification(&self, job_id: Uuid, answer: String) -> Result<bool, JobError> {
        let job = self.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        Ok(self.inner.clarifications.answer(job_id, answer).await)
    }

    /// Periodically run [`JobManager::cleanup`] until [`JobManager::shutdown`].
    pub fn spawn_sweeper(&self, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.cleanup(max_age).await {
                            warn!(error = %e, "Job cleanup sweep failed");
                        }
                    }
                }
            }
            debug!("Job sweeper stopped");
        })
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

async fn run_job(
    inner: Arc<Inner>,
    job_id: Uuid,
    request: Arc<GenerationRequest>,
    token: CancellationToken,
) {
    let permit = tokio::select! {
        _ = token.cancelled() => None,
        permit = inner.semaphore.clone().acquire_owned() => permit.ok(),
    };

    if let Some(_permit) = permit {
        let started = inner
            .store
            .update(job_id, Box::new(|job| job.transition(JobStatus::Running)))
            .await;
        match started {
            Ok(_) => {
                info!(%job_id, "Job started");
                execute(&inner, job_id, request, &token).await;
            }
            Err(e) => debug!(%job_id, error = %e, "Job not started"),
        }
    }

    inner.tokens.lock().await.remove(&job_id);
    inner.clarifications.forget(job_id).await;
}

async fn execute(inner: &Inner, job_id: Uuid, request: Arc<GenerationRequest>, token: &CancellationToken) {
    let clarifier = JobClarifier {
        job_id,
        store: inner.store.clone(),
        pending: inner.clarifications.clone(),
    };
    let run = inner.pipeline.run_with_id(job_id, request, &clarifier);

    let outcome = tokio::select! {
        _ = token.cancelled() => Outcome::Cancelled,
        finished = tokio::time::timeout(inner.timeout, run) => match finished {
            Ok(result) => Outcome::Finished(result),
            Err(_) => Outcome::TimedOut,
        },
    };

    match outcome {
        Outcome::Finished(result) => {
            let success = result.success;
            let summary = result.clone();
            match inner
                .store
                .update(job_id, Box::new(move |job| job.complete(result)))
                .await
            {
                Ok(_) => {
                    inner.metrics.record_result(&summary);
                    info!(%job_id, success, total_time_ms = summary.total_time_ms, "Job finished");
                }
                Err(e) => debug!(%job_id, error = %e, "Result discarded"),
            }
        }
        Outcome::TimedOut => {
            warn!(%job_id, timeout_secs = inner.timeout.as_secs(), "Job timed out");
            match inner
                .store
                .update(job_id, Box::new(|job| job.fail(TIMEOUT_MESSAGE)))
                .await
            {
                Ok(_) => inner.metrics.job_timed_out(),
                Err(e) => debug!(%job_id, error = %e, "Timeout not recorded"),
            }
        }
        Outcome::Cancelled => debug!(%job_id, "Pipeline dropped after cancel"),
    }
}

/// Routes a run's clarification questions through the job record.
struct JobClarifier {
    job_id: Uuid,
    store: Arc<dyn JobStore>,
    pending: Arc<PendingClarifications>,
}

#[async_trait]
impl ClarificationHandler for JobClarifier {
    async fn request(&self, _generation_id: Uuid, questions: &[String]) -> Option<String> {
        let rx = self.pending.register(self.job_id).await;
        let questions = questions.to_vec();
        let shown = self
            .store
            .update(
                self.job_id,
                Box::new(move |job| {
                    if job.status == JobStatus::Running {
                        job.clarification_questions = Some(questions);
                    }
                    Ok(())
                }),
            )
            .await;
        if let Err(e) = shown {
            warn!(job_id = %self.job_id, error = %e, "Failed to publish clarification questions");
        }
        info!(job_id = %self.job_id, "Waiting for clarification");
        rx.await.ok()
    }

    async fn finished(&self, _generation_id: Uuid) {
        self.pending.forget(self.job_id).await;
        let cleared = self
            .store
            .update(
                self.job_id,
                Box::new(|job| {
                    if !job.status.is_terminal() {
                        job.clarification_questions = None;
                    }
                    Ok(())
                }),
            )
            .await;
        if let Err(e) = cleared {
            warn!(job_id = %self.job_id, error = %e, "Failed to clear clarification questions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::context::KeywordRetriever;
    use crate::generate::llm::ScriptedProvider;
    use crate::generate::models::Scenario;
    use crate::generate::pipeline::{PipelineSettings, single_provider};

    const GOOD: &str = "## main.tf\nresource \"aws_s3_bucket\" \"logs\" {\n  bucket = var.name\n}\n\n## variables.tf\nvariable \"name\" {\n  description = \"Bucket name\"\n  type        = string\n}\n\n## outputs.tf\noutput \"arn\" {\n  description = \"Bucket ARN\"\n  value       = aws_s3_bucket.logs.arn\n}\n";

    struct Fixture {
        manager: JobManager,
        provider: Arc<ScriptedProvider>,
        _work: tempfile::TempDir,
    }

    fn fixture(provider: ScriptedProvider, max_concurrent: usize, timeout: Duration) -> Fixture {
        let work = tempfile::tempdir().unwrap();
        let provider = Arc::new(provider);
        let settings = PipelineSettings {
            work_dir: work.path().to_path_buf(),
            correction_enabled: false,
            clarification_timeout: Duration::from_secs(5),
            ..PipelineSettings::default()
        };
        let pipeline = single_provider(Arc::new(KeywordRetriever::new()), provider.clone(), settings);
        let manager = JobManager::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(pipeline),
            JobSettings {
                max_concurrent,
                timeout,
            },
        );
        Fixture {
            manager,
            provider,
            _work: work,
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("log bucket", Scenario::NewResource)
    }

    async fn wait_until<F>(manager: &JobManager, id: Uuid, done: F) -> JobSnapshot
    where
        F: Fn(&JobSnapshot) -> bool,
    {
        for _ in 0..500 {
            let snap = manager.get_status(id).await.unwrap();
            if done(&snap) {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached the expected state", id);
    }

    async fn wait_terminal(manager: &JobManager, id: Uuid) -> JobSnapshot {
        wait_until(manager, id, |s| s.status.is_terminal()).await
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let f = fixture(ScriptedProvider::replies("scripted", [GOOD]), 5, Duration::from_secs(30));
        let id = f.manager.submit(request()).await.unwrap();

        let snap = wait_terminal(&f.manager, id).await;
        assert_eq!(snap.status, JobStatus::Completed, "{:?}", snap.error_message);
        assert_eq!(snap.success, Some(true));
        assert!(snap.started_at.is_some() && snap.completed_at.is_some());

        let job = f.manager.get_result(id).await.unwrap();
        let result = job.result.unwrap();
        assert_eq!(result.generation_id, id);
        assert!(result.generated_files["main.tf"].contains("aws_s3_bucket"));

        let metrics = f.manager.metrics();
        assert_eq!(metrics.jobs_submitted, 1);
        assert_eq!(metrics.jobs_completed, 1);
    }

    #[tokio::test]
    async fn test_pipeline_failure_marks_job_failed() {
        let f = fixture(
            ScriptedProvider::new("scripted", vec![Err("provider down".into())]),
            5,
            Duration::from_secs(30),
        );
        let id = f.manager.submit(request()).await.unwrap();
        let snap = wait_terminal(&f.manager, id).await;
        assert_eq!(snap.status, JobStatus::Failed);
        assert!(snap.error_message.unwrap().contains("provider down"));
        assert_eq!(snap.success, Some(false));
    }

    #[tokio::test]
    async fn test_job_times_out() {
        let f = fixture(
            ScriptedProvider::replies("scripted", [GOOD]).with_delay(Duration::from_secs(30)),
            5,
            Duration::from_millis(100),
        );
        let id = f.manager.submit(request()).await.unwrap();
        let snap = wait_terminal(&f.manager, id).await;
        assert_eq!(snap.status, JobStatus::Failed);
        assert!(snap.error_message.unwrap().contains("timed out"));
        assert_eq!(f.manager.metrics().jobs_timed_out, 1);
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let f = fixture(
            ScriptedProvider::replies("scripted", [GOOD]).with_delay(Duration::from_secs(30)),
            5,
            Duration::from_secs(60),
        );
        let id = f.manager.submit(request()).await.unwrap();
        wait_until(&f.manager, id, |s| s.status == JobStatus::Running).await;
        // Let the pipeline reach the provider call.
        for _ in 0..100 {
            if f.provider.calls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(f.manager.cancel(id).await.unwrap());
        let snap = f.manager.get_status(id).await.unwrap();
        assert_eq!(snap.status, JobStatus::Cancelled);
        assert!(!f.manager.cancel(id).await.unwrap());

        // The background task must not overwrite the cancellation.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.manager.get_status(id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_completed_job_is_a_no_op() {
        let f = fixture(ScriptedProvider::replies("scripted", [GOOD]), 5, Duration::from_secs(30));
        let id = f.manager.submit(request()).await.unwrap();
        let before = wait_terminal(&f.manager, id).await;

        assert!(!f.manager.cancel(id).await.unwrap());
        assert_eq!(f.manager.get_status(id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let f = fixture(ScriptedProvider::replies("scripted", [GOOD]), 5, Duration::from_secs(30));
        let missing = Uuid::new_v4();
        assert!(matches!(f.manager.get_status(missing).await, Err(JobError::NotFound { .. })));
        assert!(matches!(f.manager.cancel(missing).await, Err(JobError::NotFound { .. })));
        assert!(matches!(
            f.manager.answer_clarification(missing, "x".into()).await,
            Err(JobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_semaphore_limits_concurrency() {
        let f = fixture(
            ScriptedProvider::replies("scripted", [GOOD, GOOD]).with_delay(Duration::from_millis(500)),
            1,
            Duration::from_secs(30),
        );
        let a = f.manager.submit(request()).await.unwrap();
        let b = f.manager.submit(request()).await.unwrap();

        for _ in 0..100 {
            if !f.manager.list(Some(JobStatus::Running)).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.manager.list(Some(JobStatus::Running)).await.unwrap().len(), 1);
        assert_eq!(f.manager.list(Some(JobStatus::Pending)).await.unwrap().len(), 1);

        // The queued job can still be cancelled before it starts.
        let pending = f.manager.list(Some(JobStatus::Pending)).await.unwrap()[0].job_id;
        assert!(f.manager.cancel(pending).await.unwrap());

        let other = if pending == a { b } else { a };
        assert_eq!(wait_terminal(&f.manager, other).await.status, JobStatus::Completed);
        assert_eq!(f.manager.get_status(pending).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_get_result_before_finish_is_rejected() {
        let f = fixture(
            ScriptedProvider::replies("scripted", [GOOD]).with_delay(Duration::from_secs(30)),
            5,
            Duration::from_secs(60),
        );
        let id = f.manager.submit(request()).await.unwrap();
        assert!(matches!(
            f.manager.get_result(id).await,
            Err(JobError::NotFinished { .. })
        ));
        f.manager.cancel(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_and_cleanup() {
        let f = fixture(ScriptedProvider::replies("scripted", [GOOD, GOOD]), 5, Duration::from_secs(30));
        let first = f.manager.submit(request()).await.unwrap();
        wait_terminal(&f.manager, first).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = f.manager.submit(request()).await.unwrap();
        wait_terminal(&f.manager, second).await;

        let all = f.manager.list(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].job_id, second);
        assert!(f.manager.list(Some(JobStatus::Failed)).await.unwrap().is_empty());

        assert_eq!(f.manager.cleanup(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(f.manager.cleanup(Duration::ZERO).await.unwrap(), 2);
        assert!(f.manager.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clarification_round_trip_through_job() {
        let ask = r#"{"clarification_needed": true, "questions": ["Which region?"]}"#;
        let f = fixture(ScriptedProvider::replies("scripted", [ask, GOOD]), 5, Duration::from_secs(30));
        let mut req = request();
        req.allow_clarification = true;
        let id = f.manager.submit(req).await.unwrap();

        let waiting = wait_until(&f.manager, id, |s| s.clarification_questions.is_some()).await;
        assert_eq!(waiting.status, JobStatus::Running);
        assert_eq!(waiting.clarification_questions.unwrap(), vec!["Which region?"]);

        assert!(f.manager.answer_clarification(id, "us-east-1".into()).await.unwrap());
        let snap = wait_terminal(&f.manager, id).await;
        assert_eq!(snap.status, JobStatus::Completed);
        assert!(snap.clarification_questions.is_none());

        let result = f.manager.get_result(id).await.unwrap().result.unwrap();
        let record = result.pipeline_metadata.clarification.as_ref().unwrap();
        assert_eq!(record.answer.as_deref(), Some("us-east-1"));
        assert!(!f.manager.answer_clarification(id, "late".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweeper_removes_old_jobs() {
        let f = fixture(ScriptedProvider::replies("scripted", [GOOD]), 5, Duration::from_secs(30));
        let id = f.manager.submit(request()).await.unwrap();
        wait_terminal(&f.manager, id).await;

        let handle = f.manager.spawn_sweeper(Duration::from_millis(20), Duration::ZERO);
        for _ in 0..100 {
            if f.manager.list(None).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.manager.list(None).await.unwrap().is_empty());
        f.manager.shutdown();
        handle.await.unwrap();
    }
}
