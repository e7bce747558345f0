//! Unified configuration for tfgen.
//!
//! Settings are read from `.tfgen/tfgen.toml` and layered as
//! file → environment (`TFGEN_*`, optionally via `.env`) → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 8080
//! db_path = ".tfgen/tfgen.db"
//!
//! [llm]
//! default_provider = "openai"
//! max_retries = 3
//!
//! [llm.providers.openai]
//! kind = "openai"
//! model = "gpt-4o"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [jobs]
//! max_concurrent = 5
//! timeout_secs = 300
//! store = "memory"
//!
//! [correction]
//! max_cycles = 3
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Wire protocol spoken by an LLM provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible `/v1/chat/completions` (also Ollama, vLLM, Azure proxies)
    #[default]
    Openai,
    /// Anthropic `/v1/messages`
    Anthropic,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Openai => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::Openai),
            "anthropic" => Ok(ProviderKind::Anthropic),
            _ => anyhow::bail!("Invalid provider kind '{}'. Valid values: openai, anthropic", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for local front-end development
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".tfgen/tfgen.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

/// A single named LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSection {
    #[serde(default)]
    pub kind: ProviderKind,
    pub model: String,
    /// Base URL; defaults to the public endpoint for `kind`
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl ProviderSection {
    pub fn resolved_base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => match self.kind {
                ProviderKind::Openai => "https://api.openai.com".to_string(),
                ProviderKind::Anthropic => "https://api.anthropic.com".to_string(),
            },
        }
    }

    pub fn resolved_api_key_env(&self) -> String {
        self.api_key_env.clone().unwrap_or_else(|| match self.kind {
            ProviderKind::Openai => "OPENAI_API_KEY".to_string(),
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY".to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider_name")]
    pub default_provider: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, ProviderSection>,
}

fn default_provider_name() -> String {
    "openai".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_providers() -> BTreeMap<String, ProviderSection> {
    let mut providers = BTreeMap::new();
    providers.insert(
        "openai".to_string(),
        ProviderSection {
            kind: ProviderKind::Openai,
            model: "gpt-4o".to_string(),
            base_url: None,
            api_key_env: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        },
    );
    providers.insert(
        "anthropic".to_string(),
        ProviderSection {
            kind: ProviderKind::Anthropic,
            model: "claude-sonnet-4-5".to_string(),
            base_url: None,
            api_key_env: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        },
    );
    providers
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            default_provider: default_provider_name(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            providers: default_providers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Scratch directory for validation/correction workspaces
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_clarification_timeout_secs")]
    pub clarification_timeout_secs: u64,
    /// Fail the run when validation errors survive the correction loop
    #[serde(default)]
    pub fail_on_validation_errors: bool,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".tfgen/work")
}

fn default_clarification_timeout_secs() -> u64 {
    120
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            clarification_timeout_secs: default_clarification_timeout_secs(),
            fail_on_validation_errors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
}

fn default_true() -> bool {
    true
}

fn default_max_cycles() -> u32 {
    3
}

impl Default for CorrectionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cycles: default_max_cycles(),
        }
    }
}

/// Backing store for generation jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStoreKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub store: JobStoreKind,
    /// Periodic cleanup sweep; 0 disables it (cleanup is then manual only)
    #[serde(default)]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_cleanup_max_age_secs")]
    pub cleanup_max_age_secs: u64,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_cleanup_max_age_secs() -> u64 {
    86_400
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_job_timeout_secs(),
            store: JobStoreKind::default(),
            cleanup_interval_secs: 0,
            cleanup_max_age_secs: default_cleanup_max_age_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagSection {
    /// Directory of reference documents (.md, .tf, .txt) indexed at startup
    #[serde(default)]
    pub docs_dir: Option<PathBuf>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_true")]
    pub include_builtin: bool,
}

fn default_top_k() -> usize {
    4
}

impl Default for RagSection {
    fn default() -> Self {
        Self {
            docs_dir: None,
            top_k: default_top_k(),
            include_builtin: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from(".tfgen/storage")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubSection {
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
    /// Token; falls back to the `GITHUB_TOKEN` environment variable
    #[serde(default)]
    pub token: Option<String>,
    /// Owner for new repositories; the token's user when unset
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_true")]
    pub private: bool,
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            api_url: default_github_api_url(),
            token: None,
            owner: None,
            branch: default_branch(),
            private: true,
        }
    }
}

impl GithubSection {
    pub fn resolved_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var("GITHUB_TOKEN").ok())
            .filter(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    /// Accepted bearer tokens; empty means authentication is off
    #[serde(default)]
    pub api_tokens: Vec<String>,
    /// Refuse requests (503) when no tokens are configured
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Daily-rotated log files are written here when set
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "tfgen=info,tower_http=info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
            dir: None,
        }
    }
}

/// The complete tfgen.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TfgenToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub correction: CorrectionSection,
    #[serde(default)]
    pub jobs: JobsSection,
    #[serde(default)]
    pub rag: RagSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl TfgenToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse tfgen.toml")
    }

    /// Load `<dir>/tfgen.toml`, or defaults when the file doesn't exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join("tfgen.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize tfgen.toml")
    }

    /// Apply `TFGEN_*` environment overrides on top of the file values.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(port) = get("TFGEN_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(host) = get("TFGEN_HOST") {
            self.server.host = host;
        }
        if let Some(db) = get("TFGEN_DB_PATH") {
            self.server.db_path = PathBuf::from(db);
        }
        if let Some(provider) = get("TFGEN_PROVIDER") {
            self.llm.default_provider = provider;
        }
        if let Some(model) = get("TFGEN_MODEL")
            && let Some(p) = self.llm.providers.get_mut(&self.llm.default_provider)
        {
            p.model = model;
        }
        if let Some(url) = get("TFGEN_LLM_BASE_URL")
            && let Some(p) = self.llm.providers.get_mut(&self.llm.default_provider)
        {
            p.base_url = Some(url);
        }
        if let Some(n) = get("TFGEN_MAX_CONCURRENT_JOBS").and_then(|v| v.parse().ok()) {
            self.jobs.max_concurrent = n;
        }
        if let Some(n) = get("TFGEN_JOB_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.jobs.timeout_secs = n;
        }
        if let Some(n) = get("TFGEN_MAX_CORRECTION_CYCLES").and_then(|v| v.parse().ok()) {
            self.correction.max_cycles = n;
        }
        if let Some(tokens) = get("TFGEN_API_TOKENS") {
            self.auth.api_tokens = tokens
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }
        if let Some(format) = get("TFGEN_LOG_FORMAT") {
            match format.to_lowercase().as_str() {
                "json" => self.logging.format = LogFormat::Json,
                "pretty" => self.logging.format = LogFormat::Pretty,
                _ => {}
            }
        }
    }

    /// Report configuration problems. An empty list means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.llm.providers.contains_key(&self.llm.default_provider) {
            problems.push(format!(
                "llm.default_provider '{}' has no [llm.providers.{}] section",
                self.llm.default_provider, self.llm.default_provider
            ));
        }
        for (name, p) in &self.llm.providers {
            if p.model.trim().is_empty() {
                problems.push(format!("llm.providers.{}.model is empty", name));
            }
            if !(0.0..=2.0).contains(&p.temperature) {
                problems.push(format!(
                    "llm.providers.{}.temperature {} is outside 0.0..=2.0",
                    name, p.temperature
                ));
            }
            if p.max_tokens == 0 {
                problems.push(format!("llm.providers.{}.max_tokens must be > 0", name));
            }
        }
        if self.jobs.max_concurrent == 0 {
            problems.push("jobs.max_concurrent must be > 0".to_string());
        }
        if self.jobs.timeout_secs == 0 {
            problems.push("jobs.timeout_secs must be > 0".to_string());
        }
        if self.rag.top_k == 0 {
            problems.push("rag.top_k must be > 0".to_string());
        }
        if let Some(dir) = &self.rag.docs_dir
            && !dir.is_dir()
        {
            problems.push(format!("rag.docs_dir {} is not a directory", dir.display()));
        }
        if self.auth.required && self.auth.api_tokens.is_empty() {
            problems.push("auth.required is set but auth.api_tokens is empty".to_string());
        }
        problems
    }
}

/// Resolved runtime configuration: the parsed file plus env and CLI layers.
#[derive(Debug, Clone)]
pub struct TfgenConfig {
    pub config_dir: PathBuf,
    pub toml: TfgenToml,
}

impl TfgenConfig {
    /// Load `<config_dir>/tfgen.toml` (or defaults), then apply the environment.
    pub fn load(config_dir: PathBuf) -> Result<Self> {
        let mut toml = TfgenToml::load_or_default(&config_dir)?;
        toml.apply_env();
        Ok(Self { config_dir, toml })
    }

    pub fn from_toml(toml: TfgenToml) -> Self {
        Self {
            config_dir: PathBuf::from(".tfgen"),
            toml,
        }
    }

    /// CLI overrides win over file and environment values.
    pub fn with_cli_overrides(
        mut self,
        port: Option<u16>,
        db_path: Option<PathBuf>,
        provider: Option<String>,
        dev_mode: bool,
    ) -> Self {
        if let Some(port) = port {
            self.toml.server.port = port;
        }
        if let Some(db_path) = db_path {
            self.toml.server.db_path = db_path;
        }
        if let Some(provider) = provider {
            self.toml.llm.default_provider = provider;
        }
        if dev_mode {
            self.toml.server.dev_mode = true;
        }
        self
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
