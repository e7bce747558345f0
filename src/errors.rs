//! Typed error hierarchy for tfgen.
//!
//! - `StageError`: one variant per pipeline stage, carrying the cause
//! - `LlmError`: provider client failures
//! - `JobError`: job manager and job store failures
//! - `PersistenceError`: file storage and GitHub publishing failures

use thiserror::Error;
use uuid::Uuid;

use crate::jobs::models::JobStatus;

/// Errors from the LLM provider client.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("missing API key: {0}")]
    MissingApiKey(String),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
}

impl LlmError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LlmError::Api { status, .. } => *status >= 500,
            LlmError::RateLimited { .. } => true,
            LlmError::InvalidResponse(_)
            | LlmError::MissingApiKey(_)
            | LlmError::UnknownProvider(_) => false,
        }
    }
}

/// Errors from file storage and GitHub publishing.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage error at {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid storage path '{0}'")]
    InvalidPath(String),

    #[error("GitHub API error: {0}")]
    GitHub(String),

    #[error("GitHub request failed: {0}")]
    GitHubHttp(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// A failure inside one pipeline stage. The orchestrator records these into
/// the result's `errors` list instead of propagating them.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Context retrieval failed: {0}")]
    ContextRetrieval(#[source] anyhow::Error),

    #[error("Prompt engineering failed: {0}")]
    PromptEngineering(String),

    #[error("Code generation failed: {0}")]
    Generation(#[from] LlmError),

    #[error("Validation failed: {message}")]
    Validation { message: String, error_count: usize },

    #[error("Persistence failed: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Workspace I/O failed: {0}")]
    Workspace(#[source] std::io::Error),
}

impl StageError {
    /// Short machine-readable tag for API consumers and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::ContextRetrieval(_) => "context_retrieval",
            StageError::PromptEngineering(_) => "prompt_engineering",
            StageError::Generation(_) => "generation",
            StageError::Validation { .. } => "validation",
            StageError::Persistence(_) => "persistence",
            StageError::Workspace(_) => "workspace",
        }
    }
}

/// Errors from the job manager and job stores.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid job transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Job {id} has not finished (status: {status})")]
    NotFinished { id: Uuid, status: JobStatus },

    #[error("Job store error: {0}")]
    Store(#[source] anyhow::Error),
}
