//! The generation pipeline.
//!
//! Drives one request through context retrieval, prompt engineering, code
//! generation and validation (with the correction loop), then hands the files
//! to persistence. Stage failures never escape [`PipelineOrchestrator::run`]:
//! they are recorded into the returned [`GenerationResult`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::clarify::{ClarificationHandler, detect_clarification};
use super::context::ContextRetriever;
use super::corrector::{ErrorCorrector, write_files};
use super::llm::{CompletionOptions, LlmProvider, ProviderRegistry};
use super::models::{
    ClarificationRecord, GenerationRequest, GenerationResult, PipelineError, PipelineMetadata,
    PipelineStage, StageResult,
};
use super::parser::ResponseParser;
use super::prompt::PromptEngineer;
use super::validator::Validator;
use crate::config::TfgenToml;
use crate::errors::StageError;
use crate::persist::PersistenceService;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub work_dir: PathBuf,
    pub top_k: usize,
    pub correction_enabled: bool,
    pub max_correction_cycles: u32,
    pub clarification_timeout: Duration,
    pub fail_on_validation_errors: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&TfgenToml::default())
    }
}

impl PipelineSettings {
    pub fn from_config(toml: &TfgenToml) -> Self {
        Self {
            work_dir: toml.pipeline.work_dir.clone(),
            top_k: toml.rag.top_k,
            correction_enabled: toml.correction.enabled,
            max_correction_cycles: toml.correction.max_cycles,
            clarification_timeout: Duration::from_secs(toml.pipeline.clarification_timeout_secs),
            fail_on_validation_errors: toml.pipeline.fail_on_validation_errors,
        }
    }
}

/// Scratch directory for one run; removed when dropped.
struct Workspace {
    path: PathBuf,
}

impl Workspace {
    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "Failed to remove workspace");
        }
    }
}

/// Mutable state of one run.
struct Run {
    id: Uuid,
    stage: PipelineStage,
    stage_started: Instant,
    metadata: PipelineMetadata,
}

impl Run {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            stage: PipelineStage::Initialized,
            stage_started: Instant::now(),
            metadata: PipelineMetadata::default(),
        }
    }

    fn enter(&mut self, to: PipelineStage) {
        debug_assert!(
            self.stage.can_transition_to(&to),
            "illegal stage transition {} -> {}",
            self.stage,
            to
        );
        self.stage = to;
        self.metadata.final_stage = to;
        self.stage_started = Instant::now();
        if !to.is_terminal() {
            info!(generation_id = %self.id, stage = %to, "Entering stage");
        }
    }

    fn finish_stage(&mut self, succeeded: bool, summary: serde_json::Value) {
        self.metadata.stage_results.push(StageResult {
            stage: self.stage.as_str().to_string(),
            duration_ms: self.stage_started.elapsed().as_millis() as u64,
            succeeded,
            summary,
        });
    }
}

pub struct PipelineOrchestrator {
    retriever: Arc<dyn ContextRetriever>,
    providers: ProviderRegistry,
    prompts: PromptEngineer,
    parser: Arc<ResponseParser>,
    persistence: Option<Arc<PersistenceService>>,
    settings: PipelineSettings,
}

impl PipelineOrchestrator {
    pub fn new(
        retriever: Arc<dyn ContextRetriever>,
        providers: ProviderRegistry,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            retriever,
            providers,
            prompts: PromptEngineer::new(),
            parser: Arc::new(ResponseParser::new()),
            persistence: None,
            settings,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<PersistenceService>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub async fn run(
        &self,
        request: Arc<GenerationRequest>,
        clarifier: &dyn ClarificationHandler,
    ) -> GenerationResult {
        self.run_with_id(Uuid::new_v4(), request, clarifier).await
    }

    /// Run the pipeline under a caller-chosen generation id.
    pub async fn run_with_id(
        &self,
        generation_id: Uuid,
        request: Arc<GenerationRequest>,
        clarifier: &dyn ClarificationHandler,
    ) -> GenerationResult {
        let started = Instant::now();
        let mut run = Run::new(generation_id);
        run.metadata.expected_files = request.expected_files();
        let mut files = BTreeMap::new();
        let mut errors = Vec::new();

        match self.execute(&mut run, &request, clarifier, &mut files).await {
            Ok(()) => run.enter(PipelineStage::Completed),
            Err(e) => {
                let message = e.to_string();
                error!(
                    generation_id = %generation_id,
                    stage = %run.stage,
                    kind = e.kind(),
                    error = %message,
                    "Pipeline stage failed"
                );
                run.finish_stage(false, json!({ "error": message }));
                errors.push(PipelineError {
                    stage: run.stage,
                    kind: e.kind().to_string(),
                    message,
                });
                run.enter(PipelineStage::Failed);
            }
        }

        let total_time_ms = started.elapsed().as_millis() as u64;
        info!(
            generation_id = %generation_id,
            final_stage = %run.stage,
            files = files.len(),
            tokens = run.metadata.token_usage.total(),
            total_time_ms,
            "Pipeline finished"
        );
        GenerationResult::new(
            generation_id,
            (*request).clone(),
            files,
            run.metadata,
            errors,
            total_time_ms,
        )
    }

    async fn execute(
        &self,
        run: &mut Run,
        request: &GenerationRequest,
        clarifier: &dyn ClarificationHandler,
        files: &mut BTreeMap<String, String>,
    ) -> Result<(), StageError> {
        run.enter(PipelineStage::ContextRetrieval);
        let docs = self
            .retriever
            .retrieve(&request.query, request.scenario, self.settings.top_k)
            .await
            .map_err(StageError::ContextRetrieval)?;
        run.metadata.context_documents = docs.iter().map(|d| d.source.clone()).collect();
        run.finish_stage(true, json!({ "documents": docs.len() }));

        run.enter(PipelineStage::PromptEngineering);
        let prompt = self
            .prompts
            .build(request, &docs)
            .map_err(StageError::PromptEngineering)?;
        run.finish_stage(
            true,
            json!({ "prompt_chars": prompt.char_len(), "expected_files": prompt.expected_files }),
        );

        run.enter(PipelineStage::CodeGeneration);
        let provider = self.providers.get(request.provider.as_deref())?;
        let options = CompletionOptions {
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };
        run.metadata.provider = Some(provider.name().to_string());
        run.metadata.model = Some(provider.model().to_string());

        let mut response = provider.complete(&prompt, &options).await?;
        run.metadata.token_usage.add(&response.usage);

        if request.allow_clarification
            && let Some(questions) = detect_clarification(&response.text)
        {
            info!(generation_id = %run.id, questions = questions.len(), "Model asked for clarification");
            let answer = match tokio::time::timeout(
                self.settings.clarification_timeout,
                clarifier.request(run.id, &questions),
            )
            .await
            {
                Ok(answer) => answer,
                Err(_) => {
                    warn!(generation_id = %run.id, "Clarification timed out, continuing with assumptions");
                    None
                }
            };
            clarifier.finished(run.id).await;

            let follow_up = self
                .prompts
                .with_clarification(&prompt, &questions, answer.as_deref());
            run.metadata.clarification = Some(ClarificationRecord { questions, answer });
            response = provider.complete(&follow_up, &options).await?;
            run.metadata.token_usage.add(&response.usage);
        }
        run.metadata.model = Some(response.model.clone());

        *files = self.parser.parse(&response.text, &prompt.expected_files);
        let populated = files.values().filter(|c| !c.trim().is_empty()).count();
        run.finish_stage(
            true,
            json!({
                "response_chars": response.text.len(),
                "files": files.len(),
                "populated_files": populated,
                "tokens": run.metadata.token_usage.total(),
            }),
        );

        run.enter(PipelineStage::Validation);
        let validator = Validator::for_scenario(request.scenario);
        let mut validation = validator.validate(files);
        info!(
            generation_id = %run.id,
            errors = validation.error_count,
            warnings = validation.warning_count,
            "Validated generated files"
        );

        if self.settings.correction_enabled && validation.error_count > 0 {
            let workspace = self.workspace(run.id, files).await?;
            let corrector = ErrorCorrector::new(provider.clone(), validator, self.parser.clone())
                .with_max_cycles(self.settings.max_correction_cycles)
                .with_options(options);
            let outcome = corrector
                .correct(workspace.path(), &prompt.expected_files, validation)
                .await;
            run.metadata.token_usage.add(&outcome.token_usage());
            if !outcome.files.is_empty() {
                *files = outcome.files.clone();
            }
            validation = outcome.validation.clone();
            run.metadata.correction = Some(outcome);
        }

        let remaining = validation.error_count;
        let summary = json!({
            "errors": remaining,
            "warnings": validation.warning_count,
            "passed": validation.passed,
            "correction_cycles": run.metadata.correction.as_ref().map_or(0, |c| c.cycles.len()),
        });
        run.metadata.validation = Some(validation);
        if remaining > 0 && self.settings.fail_on_validation_errors {
            return Err(StageError::Validation {
                message: format!("{} error(s) remain after correction", remaining),
                error_count: remaining,
            });
        }
        run.finish_stage(true, summary);

        if let Some(persistence) = &self.persistence {
            let started = Instant::now();
            let summary = persistence.persist(run.id, request, files).await;
            run.metadata.stage_results.push(StageResult {
                stage: "persistence".to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
                succeeded: summary.warnings.is_empty(),
                summary: json!({
                    "stored_files": summary.storage_paths.len(),
                    "project_id": summary.project_id,
                    "warnings": summary.warnings.len(),
                }),
            });
            run.metadata.persistence = Some(summary);
        }
        Ok(())
    }

    async fn workspace(
        &self,
        id: Uuid,
        files: &BTreeMap<String, String>,
    ) -> Result<Workspace, StageError> {
        let workspace = Workspace {
            path: self.settings.work_dir.join(id.to_string()),
        };
        write_files(workspace.path(), files)
            .await
            .map_err(|e| StageError::Workspace(std::io::Error::other(format!("{:#}", e))))?;
        Ok(workspace)
    }
}

/// Build a single-provider orchestrator; handy for the CLI and tests.
pub fn single_provider(
    retriever: Arc<dyn ContextRetriever>,
    provider: Arc<dyn LlmProvider>,
    settings: PipelineSettings,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new(retriever, ProviderRegistry::single(provider), settings)
}
