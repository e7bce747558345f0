//! One-shot generation command: `tfgen generate`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use super::super::Cli;
use tfgen::app;
use tfgen::generate::clarify::NoClarification;
use tfgen::generate::corrector::write_files;
use tfgen::generate::llm::ProviderRegistry;
use tfgen::generate::{GenerationRequest, PipelineOrchestrator, PipelineSettings, Scenario};

pub struct GenerateArgs {
    pub query: String,
    pub scenario: String,
    pub existing: Option<PathBuf>,
    pub target_file: Option<String>,
    pub provider: Option<String>,
    pub output: PathBuf,
    pub correction: bool,
    pub project: Option<String>,
}

pub async fn cmd_generate(cli: &Cli, args: GenerateArgs) -> Result<()> {
    let scenario: Scenario = args.scenario.parse().map_err(anyhow::Error::msg)?;
    let mut request = GenerationRequest::new(args.query, scenario);
    if let Some(path) = &args.existing {
        let code = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        request.existing_code = Some(code);
    }
    request.target_file_path = args.target_file;
    request.provider = args.provider;
    request.project_name = args.project.clone();
    if let Err(problem) = request.check() {
        bail!("Invalid request: {}", problem);
    }

    let (config, _guard) = super::load_config(cli)?;
    let mut toml = config.toml;
    if !args.correction {
        toml.correction.enabled = false;
    }

    let pipeline = if args.project.is_some() {
        app::build_pipeline(&toml, Some(app::open_db(&toml)?))?
    } else {
        PipelineOrchestrator::new(
            app::build_retriever(&toml)?,
            ProviderRegistry::from_config(&toml.llm).context("Failed to configure LLM providers")?,
            PipelineSettings::from_config(&toml),
        )
    };

    let result = pipeline.run(Arc::new(request), &NoClarification).await;
    let meta = &result.pipeline_metadata;

    if !result.generated_files.is_empty() {
        write_files(&args.output, &result.generated_files).await?;
        println!("Wrote {} file(s) to {}", result.generated_files.len(), args.output.display());
        for name in result.generated_files.keys() {
            println!("  {}", name);
        }
    }
    if let Some(validation) = &meta.validation {
        println!(
            "Validation: {} error(s), {} warning(s)",
            validation.error_count, validation.warning_count
        );
    }
    if let Some(correction) = &meta.correction {
        println!(
            "Correction: {} cycle(s), {} -> {} error(s)",
            correction.cycles.len(),
            correction.initial_errors,
            correction.final_errors
        );
    }
    println!(
        "Tokens: {} prompt, {} completion ({} ms)",
        meta.token_usage.prompt_tokens, meta.token_usage.completion_tokens, result.total_time_ms
    );

    match result.error_summary() {
        Some(summary) => bail!("Generation failed: {}", summary),
        None => Ok(()),
    }
}
