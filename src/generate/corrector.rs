//! Bounded correction loop: feed validation errors back to the model until
//! the files validate or the cycle budget runs out.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::llm::{CompletionOptions, LlmProvider};
use super::models::{CorrectionCycle, CorrectionOutcome, TokenUsage, ValidationResult};
use super::parser::ResponseParser;
use super::prompt::PromptEngineer;
use super::validator::Validator;

pub const DEFAULT_MAX_CYCLES: u32 = 3;

pub struct ErrorCorrector {
    provider: Arc<dyn LlmProvider>,
    validator: Validator,
    parser: Arc<ResponseParser>,
    prompts: PromptEngineer,
    options: CompletionOptions,
    max_cycles: u32,
}

impl ErrorCorrector {
    pub fn new(provider: Arc<dyn LlmProvider>, validator: Validator, parser: Arc<ResponseParser>) -> Self {
        Self {
            provider,
            validator,
            parser,
            prompts: PromptEngineer::new(),
            options: CompletionOptions::default(),
            max_cycles: DEFAULT_MAX_CYCLES,
        }
    }

    pub fn with_max_cycles(mut self, max_cycles: u32) -> Self {
        self.max_cycles = max_cycles;
        self
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    /// Run up to `max_cycles` passes over the files in `workspace`.
    ///
    /// `initial` is the validation of the files as they are on disk. LLM and
    /// I/O failures end the loop and are reported in `aborted_reason`; the
    /// outcome always carries the last file state that was written.
    pub async fn correct(
        &self,
        workspace: &Path,
        expected: &[String],
        initial: ValidationResult,
    ) -> CorrectionOutcome {
        let initial_errors = initial.error_count;
        let mut outcome = CorrectionOutcome {
            initial_errors,
            final_errors: initial_errors,
            ..CorrectionOutcome::default()
        };

        let mut files = match read_expected(workspace, expected).await {
            Ok(files) => files,
            Err(e) => {
                outcome.aborted_reason = Some(format!("{:#}", e));
                outcome.validation = initial;
                return outcome;
            }
        };
        let mut validation = initial;

        for cycle in 1..=self.max_cycles {
            if validation.error_count == 0 {
                break;
            }
            let started = Instant::now();
            let errors_before = validation.error_count;
            let errors: Vec<_> = validation.errors().collect();
            let prompt = self.prompts.correction(&files, &errors, expected);

            let response = match self.provider.complete(&prompt, &self.options).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(cycle, error = %e, "Correction call failed, stopping");
                    outcome.aborted_reason = Some(format!("cycle {}: {}", cycle, e));
                    break;
                }
            };

            let reply = self.parser.parse(&response.text, expected);
            for (name, content) in reply {
                if !content.trim().is_empty() {
                    files.insert(name, content);
                }
            }
            if let Err(e) = write_files(workspace, &files).await {
                warn!(cycle, error = %e, "Failed to write corrected files");
                outcome.aborted_reason = Some(format!("cycle {}: {:#}", cycle, e));
                break;
            }

            validation = self.validator.validate(&files);
            let record = CorrectionCycle {
                cycle,
                errors_before,
                errors_after: validation.error_count,
                token_usage: response.usage,
                duration_ms: started.elapsed().as_millis() as u64,
            };
            info!(
                cycle,
                errors_before = record.errors_before,
                errors_after = record.errors_after,
                tokens = record.token_usage.total(),
                "Correction cycle finished"
            );
            outcome.cycles.push(record);
        }

        outcome.final_errors = validation.error_count;
        outcome.correction_successful = validation.error_count == 0;
        outcome.files = files;
        outcome.validation = validation;
        outcome
    }
}

impl CorrectionOutcome {
    pub fn token_usage(&self) -> TokenUsage {
        let mut total = TokenUsage::default();
        for cycle in &self.cycles {
            total.add(&cycle.token_usage);
        }
        total
    }
}

/// Current content of each expected file; missing files read as empty.
async fn read_expected(dir: &Path, expected: &[String]) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    for name in expected {
        let path = dir.join(name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        files.insert(name.clone(), content);
    }
    Ok(files)
}

pub async fn write_files(dir: &Path, files: &BTreeMap<String, String>) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    for (name, content) in files {
        let path = dir.join(name);
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}
