use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of Terraform change the caller wants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    #[default]
    #[serde(alias = "NEW_RESOURCE")]
    NewResource,
    #[serde(alias = "MODIFY_RESOURCE")]
    ModifyResource,
    #[serde(alias = "NEW_MODULE")]
    NewModule,
    #[serde(alias = "NEW_VARIABLES")]
    NewVariables,
    #[serde(alias = "NEW_OUTPUTS")]
    NewOutputs,
}

impl Scenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewResource => "new_resource",
            Self::ModifyResource => "modify_resource",
            Self::NewModule => "new_module",
            Self::NewVariables => "new_variables",
            Self::NewOutputs => "new_outputs",
        }
    }

    /// Files the model is asked to produce for this scenario, in prompt order.
    pub fn expected_files(&self, target_file_path: Option<&str>) -> Vec<String> {
        match self {
            Self::NewResource => vec!["main.tf".into(), "variables.tf".into(), "outputs.tf".into()],
            Self::ModifyResource => {
                let target = target_file_path
                    .and_then(|p| p.rsplit(['/', '\\']).next())
                    .filter(|name| !name.is_empty())
                    .unwrap_or("main.tf");
                vec![target.to_string()]
            }
            Self::NewModule => vec![
                "main.tf".into(),
                "variables.tf".into(),
                "outputs.tf".into(),
                "versions.tf".into(),
            ],
            Self::NewVariables => vec!["variables.tf".into()],
            Self::NewOutputs => vec!["outputs.tf".into()],
        }
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "new_resource" => Ok(Self::NewResource),
            "modify_resource" => Ok(Self::ModifyResource),
            "new_module" => Ok(Self::NewModule),
            "new_variables" => Ok(Self::NewVariables),
            "new_outputs" => Ok(Self::NewOutputs),
            _ => Err(format!("Invalid scenario: {}", s)),
        }
    }
}

/// A single generation request. Built once and shared read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationRequest {
    pub query: String,
    #[serde(default)]
    pub scenario: Scenario,
    #[serde(default)]
    pub existing_code: Option<String>,
    #[serde(default)]
    pub target_file_path: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub allow_clarification: bool,
    #[serde(default)]
    pub push_to_github: bool,
}

impl GenerationRequest {
    pub fn new(query: impl Into<String>, scenario: Scenario) -> Self {
        Self {
            query: query.into(),
            scenario,
            existing_code: None,
            target_file_path: None,
            provider: None,
            temperature: None,
            max_tokens: None,
            project_id: None,
            project_name: None,
            allow_clarification: false,
            push_to_github: false,
        }
    }

    /// Reject requests the pipeline cannot act on.
    pub fn check(&self) -> Result<(), String> {
        if self.query.trim().is_empty() {
            return Err("query must not be empty".to_string());
        }
        if self.scenario == Scenario::ModifyResource
            && self.existing_code.as_deref().is_none_or(|c| c.trim().is_empty())
        {
            return Err("modify_resource requires existing_code".to_string());
        }
        if let Some(target) = &self.target_file_path {
            check_target_path(target)?;
        }
        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(format!("temperature {} is outside 0.0..=2.0", t));
        }
        if self.max_tokens == Some(0) {
            return Err("max_tokens must be > 0".to_string());
        }
        Ok(())
    }

    pub fn expected_files(&self) -> Vec<String> {
        self.scenario.expected_files(self.target_file_path.as_deref())
    }
}

/// A target file must name a file relative to the configuration root.
fn check_target_path(target: &str) -> Result<(), String> {
    let trimmed = target.trim();
    let file_name = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    if file_name.trim().is_empty() {
        return Err("target_file_path must name a file".to_string());
    }
    let absolute = trimmed.starts_with(['/', '\\'])
        || trimmed.as_bytes().get(1) == Some(&b':');
    if absolute || trimmed.split(['/', '\\']).any(|part| part == "..") {
        return Err(format!("target_file_path '{}' must be a relative path inside the project", target));
    }
    Ok(())
}

/// Pipeline state machine. Stages advance strictly in declaration order;
/// `Failed` is reachable from any non-terminal stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Initialized,
    ContextRetrieval,
    PromptEngineering,
    CodeGeneration,
    Validation,
    Completed,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::ContextRetrieval => "context_retrieval",
            Self::PromptEngineering => "prompt_engineering",
            Self::CodeGeneration => "code_generation",
            Self::Validation => "validation",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// The successor on the happy path; `None` for terminal stages.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Initialized => Some(Self::ContextRetrieval),
            Self::ContextRetrieval => Some(Self::PromptEngineering),
            Self::PromptEngineering => Some(Self::CodeGeneration),
            Self::CodeGeneration => Some(Self::Validation),
            Self::Validation => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, to: &Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        *to == Self::Failed || self.next().as_ref() == Some(to)
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Timing and summary for one pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub duration_ms: u64,
    pub succeeded: bool,
    pub summary: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    Syntax,
    Semantic,
    Security,
    Style,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Violation {
    pub error_type: ViolationType,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Violation {
    /// One-line rendering used in correction prompts and logs.
    pub fn describe(&self) -> String {
        let loc = match &self.location {
            Some(Location { file, line: Some(line) }) => format!("{}:{}: ", file, line),
            Some(Location { file, line: None }) => format!("{}: ", file),
            None => String::new(),
        };
        let mut out = format!(
            "{}[{:?}/{:?}] {}",
            loc, self.severity, self.error_type, self.message
        );
        if let Some(s) = &self.suggestion {
            out.push_str(&format!(" (suggestion: {})", s));
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub violations: Vec<Violation>,
    pub error_count: usize,
    pub warning_count: usize,
    pub info_count: usize,
    pub files_checked: usize,
    pub passed: bool,
}

impl ValidationResult {
    pub fn from_violations(mut violations: Vec<Violation>, files_checked: usize) -> Self {
        violations.sort_by(|a, b| a.severity.cmp(&b.severity));
        let count = |s: Severity| violations.iter().filter(|v| v.severity == s).count();
        let error_count = count(Severity::Error);
        Self {
            warning_count: count(Severity::Warning),
            info_count: count(Severity::Info),
            error_count,
            files_checked,
            passed: error_count == 0,
            violations,
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.severity == Severity::Error)
    }
}

/// What happened during one correction pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionCycle {
    pub cycle: u32,
    pub errors_before: usize,
    pub errors_after: usize,
    pub token_usage: TokenUsage,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrectionOutcome {
    pub initial_errors: usize,
    pub final_errors: usize,
    pub cycles: Vec<CorrectionCycle>,
    pub correction_successful: bool,
    /// Set when a cycle was cut short by an LLM failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_reason: Option<String>,
    #[serde(skip)]
    pub files: BTreeMap<String, String>,
    #[serde(skip)]
    pub validation: ValidationResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationRecord {
    pub questions: Vec<String>,
    /// `None` when the caller never answered before the timeout
    pub answer: Option<String>,
}

/// Status of the optional GitHub push.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GithubStatus {
    pub pushed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceSummary {
    pub project_id: Option<i64>,
    pub storage_paths: BTreeMap<String, String>,
    pub github_status: Option<GithubStatus>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineMetadata {
    pub final_stage: PipelineStage,
    pub stage_results: Vec<StageResult>,
    pub token_usage: TokenUsage,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub context_documents: Vec<String>,
    pub expected_files: Vec<String>,
    pub validation: Option<ValidationResult>,
    pub correction: Option<CorrectionOutcome>,
    pub clarification: Option<ClarificationRecord>,
    pub persistence: Option<PersistenceSummary>,
}

impl Default for PipelineMetadata {
    fn default() -> Self {
        Self {
            final_stage: PipelineStage::Initialized,
            stage_results: Vec::new(),
            token_usage: TokenUsage::default(),
            provider: None,
            model: None,
            context_documents: Vec::new(),
            expected_files: Vec::new(),
            validation: None,
            correction: None,
            clarification: None,
            persistence: None,
        }
    }
}

/// Error entry recorded into a result; keeps the stage tag next to the message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineError {
    pub stage: PipelineStage,
    pub kind: String,
    pub message: String,
}

/// Output of one pipeline run. `success` is false iff `errors` is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub generation_id: Uuid,
    pub request: GenerationRequest,
    pub generated_files: BTreeMap<String, String>,
    pub pipeline_metadata: PipelineMetadata,
    pub errors: Vec<PipelineError>,
    pub success: bool,
    pub total_time_ms: u64,
}

impl GenerationResult {
    pub fn new(
        generation_id: Uuid,
        request: GenerationRequest,
        generated_files: BTreeMap<String, String>,
        pipeline_metadata: PipelineMetadata,
        errors: Vec<PipelineError>,
        total_time_ms: u64,
    ) -> Self {
        Self {
            generation_id,
            request,
            generated_files,
            pipeline_metadata,
            success: errors.is_empty(),
            errors,
            total_time_ms,
        }
    }

    /// Human-readable summary of the recorded errors.
    pub fn error_summary(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        Some(
            self.errors
                .iter()
                .map(|e| e.message.clone())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}
