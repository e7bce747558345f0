//! Building the runtime pieces from configuration.
//!
//! Shared by `tfgen serve` and the one-shot CLI commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{JobStoreKind, TfgenToml};
use crate::db::{AppDb, DbHandle};
use crate::generate::context::{ContextRetriever, KeywordRetriever};
use crate::generate::llm::ProviderRegistry;
use crate::generate::pipeline::{PipelineOrchestrator, PipelineSettings};
use crate::jobs::{InMemoryJobStore, JobManager, JobSettings, JobStore, SqliteJobStore};
use crate::persist::{GithubPublisher, LocalFileStore, PersistenceService};

pub fn open_db(toml: &TfgenToml) -> Result<DbHandle> {
    let db = AppDb::new(&toml.server.db_path).with_context(|| {
        format!(
            "Failed to open database at {}",
            toml.server.db_path.display()
        )
    })?;
    Ok(DbHandle::new(db))
}

pub fn build_retriever(toml: &TfgenToml) -> Result<Arc<dyn ContextRetriever>> {
    let mut retriever = if toml.rag.include_builtin {
        KeywordRetriever::with_builtin()
    } else {
        KeywordRetriever::new()
    };
    if let Some(dir) = &toml.rag.docs_dir {
        let indexed = retriever
            .index_dir(dir)
            .with_context(|| format!("Failed to index documents in {}", dir.display()))?;
        info!(dir = %dir.display(), chunks = indexed, "Indexed reference documents");
    }
    Ok(Arc::new(retriever))
}

pub fn build_persistence(toml: &TfgenToml, db: Option<DbHandle>) -> PersistenceService {
    let store = Arc::new(LocalFileStore::new(&toml.storage.root));
    let mut service = PersistenceService::new(store).with_github(GithubPublisher::from_config(&toml.github));
    if let Some(db) = db {
        service = service.with_db(db);
    }
    service
}

/// The orchestrator with every configured provider. `db` enables project
/// and file records.
pub fn build_pipeline(toml: &TfgenToml, db: Option<DbHandle>) -> Result<PipelineOrchestrator> {
    let providers =
        ProviderRegistry::from_config(&toml.llm).context("Failed to configure LLM providers")?;
    let orchestrator = PipelineOrchestrator::new(
        build_retriever(toml)?,
        providers,
        PipelineSettings::from_config(toml),
    )
    .with_persistence(Arc::new(build_persistence(toml, db)));
    Ok(orchestrator)
}

/// The job manager plus, when configured, its cleanup sweeper.
pub async fn build_job_manager(
    toml: &TfgenToml,
    db: DbHandle,
    pipeline: PipelineOrchestrator,
) -> Result<JobManager> {
    let store: Arc<dyn JobStore> = match toml.jobs.store {
        JobStoreKind::Memory => Arc::new(InMemoryJobStore::new()),
        JobStoreKind::Sqlite => Arc::new(
            SqliteJobStore::open(db)
                .await
                .context("Failed to open job store")?,
        ),
    };
    let manager = JobManager::new(store, Arc::new(pipeline), JobSettings::from_config(&toml.jobs));
    if toml.jobs.cleanup_interval_secs > 0 {
        manager.spawn_sweeper(
            Duration::from_secs(toml.jobs.cleanup_interval_secs),
            Duration::from_secs(toml.jobs.cleanup_max_age_secs),
        );
        info!(
            interval_secs = toml.jobs.cleanup_interval_secs,
            max_age_secs = toml.jobs.cleanup_max_age_secs,
            "Job cleanup sweeper started"
        );
    }
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toml_in(dir: &std::path::Path) -> TfgenToml {
        let mut toml = TfgenToml::default();
        toml.server.db_path = dir.join("tfgen.db");
        toml.storage.root = dir.join("storage");
        toml.pipeline.work_dir = dir.join("work");
        toml
    }

    #[tokio::test]
    async fn test_builds_from_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let toml = toml_in(dir.path());
        let db = open_db(&toml).unwrap();
        let pipeline = build_pipeline(&toml, Some(db.clone())).unwrap();
        assert_eq!(pipeline.providers().default_name(), "openai");

        let manager = build_job_manager(&toml, db, pipeline).await.unwrap();
        assert!(manager.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_job_store_selected() {
        let dir = tempfile::tempdir().unwrap();
        let mut toml = toml_in(dir.path());
        toml.jobs.store = JobStoreKind::Sqlite;
        let db = open_db(&toml).unwrap();
        let pipeline = build_pipeline(&toml, None).unwrap();
        let manager = build_job_manager(&toml, db.clone(), pipeline).await.unwrap();
        assert!(manager.list(None).await.unwrap().is_empty());
        assert!(db.call(|db| db.list_jobs(None)).await.unwrap().is_empty());
    }

    #[test]
    fn test_missing_docs_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut toml = toml_in(dir.path());
        toml.rag.docs_dir = Some(dir.path().join("does-not-exist"));
        assert!(build_retriever(&toml).is_err());
    }
}
