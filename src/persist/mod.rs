//! Saving finished generations: file storage, project records, GitHub.
//!
//! Persistence never fails a run. Every problem is logged and returned as a
//! warning in the [`PersistenceSummary`].

pub mod github;
pub mod storage;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{DbHandle, NewStoredFile, ProjectRef};
use crate::errors::{PersistenceError, StageError};
use crate::generate::models::{GenerationRequest, GithubStatus, PersistenceSummary};
use crate::util::slugify;

pub use github::GithubPublisher;
pub use storage::{FileStore, LocalFileStore};

const FALLBACK_PROJECT: &str = "tfgen-project";

pub struct PersistenceService {
    store: Arc<dyn FileStore>,
    db: Option<DbHandle>,
    github: Option<GithubPublisher>,
}

impl PersistenceService {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self {
            store,
            db: None,
            github: None,
        }
    }

    pub fn with_db(mut self, db: DbHandle) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_github(mut self, github: Option<GithubPublisher>) -> Self {
        self.github = github;
        self
    }

    pub fn storage_path(generation_id: Uuid, filename: &str) -> String {
        format!("generations/{}/{}", generation_id, filename)
    }

    fn project_ref(request: &GenerationRequest) -> ProjectRef {
        if let Some(id) = request.project_id {
            return ProjectRef::Id(id);
        }
        let name = request
            .project_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| slugify(&request.query));
        if name.is_empty() {
            ProjectRef::Name(FALLBACK_PROJECT.to_string())
        } else {
            ProjectRef::Name(name)
        }
    }

    /// Store `files`, record them against the request's project, and push to
    /// GitHub when asked.
    pub async fn persist(
        &self,
        generation_id: Uuid,
        request: &GenerationRequest,
        files: &BTreeMap<String, String>,
    ) -> PersistenceSummary {
        let mut summary = PersistenceSummary::default();
        let mut stored = Vec::new();

        let uploads = files.iter().map(|(filename, content)| async move {
            let path = Self::storage_path(generation_id, filename);
            (filename, content, self.store.put(&path, content.as_bytes()).await)
        });
        for (filename, content, uploaded) in join_all(uploads).await {
            match uploaded {
                Ok(location) => {
                    summary.storage_paths.insert(filename.clone(), location.clone());
                    stored.push(NewStoredFile {
                        filename: filename.clone(),
                        storage_path: location,
                        content: content.clone(),
                    });
                }
                Err(e) => push_warning(&mut summary, e),
            }
        }

        let mut project_name = match Self::project_ref(request) {
            ProjectRef::Name(n) => n,
            ProjectRef::Id(id) => format!("project-{}", id),
        };

        if let Some(db) = &self.db {
            let project = Self::project_ref(request);
            let result = db
                .call(move |db| db.record_generation(&project, generation_id, &stored))
                .await;
            match result {
                Ok((project, files)) => {
                    info!(
                        generation_id = %generation_id,
                        project_id = project.id,
                        files = files.len(),
                        "Recorded generation"
                    );
                    summary.project_id = Some(project.id);
                    project_name = project.name;
                }
                Err(e) => push_warning(&mut summary, PersistenceError::Database(e)),
            }
        }

        if request.push_to_github {
            let status = self
                .push(generation_id, request, &project_name, files, &mut summary)
                .await;
            summary.github_status = Some(status);
        }

        summary
    }

    async fn push(
        &self,
        generation_id: Uuid,
        request: &GenerationRequest,
        project_name: &str,
        files: &BTreeMap<String, String>,
        summary: &mut PersistenceSummary,
    ) -> GithubStatus {
        let Some(github) = &self.github else {
            let err = PersistenceError::GitHub("push requested but no GitHub token is configured".into());
            let status = GithubStatus {
                error: Some(err.to_string()),
                ..GithubStatus::default()
            };
            push_warning(summary, err);
            return status;
        };

        let repo_name = match slugify(project_name) {
            s if s.is_empty() => FALLBACK_PROJECT.to_string(),
            s => s,
        };
        let message = format!(
            "Generate {} ({})\n\n{}",
            request.scenario.as_str(),
            generation_id,
            request.query.trim()
        );
        match github.publish(&repo_name, &message, files).await {
            Ok(status) => {
                if let (Some(db), Some(project_id), Some(repo)) =
                    (&self.db, summary.project_id, status.repository.clone())
                    && let Err(e) = db
                        .call(move |db| db.update_project_github_repo(project_id, &repo))
                        .await
                {
                    push_warning(summary, PersistenceError::Database(e));
                }
                status
            }
            Err(e) => {
                let status = GithubStatus {
                    error: Some(e.to_string()),
                    ..GithubStatus::default()
                };
                push_warning(summary, e);
                status
            }
        }
    }
}

fn push_warning(summary: &mut PersistenceSummary, err: PersistenceError) {
    let message = StageError::Persistence(err).to_string();
    warn!(error = %message, "Persistence step failed");
    summary.warnings.push(message);
}
