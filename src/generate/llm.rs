//! LLM provider clients.
//!
//! `HttpLlmClient` speaks either the OpenAI-compatible chat completions
//! protocol or the Anthropic Messages protocol, retrying transient failures
//! with exponential backoff. `ProviderRegistry` maps configured provider
//! names to clients.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{LlmSection, ProviderKind, ProviderSection};
use crate::errors::LlmError;

use super::models::TokenUsage;
use super::prompt::EngineeredPrompt;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Per-call overrides taken from the generation request.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub model: String,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    async fn complete(
        &self,
        prompt: &EngineeredPrompt,
        options: &CompletionOptions,
    ) -> Result<LlmResponse, LlmError>;
}

/// Exponential backoff: `base * 2^attempt`, capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32, err: &LlmError) -> Duration {
        if let LlmError::RateLimited { retry_after: Some(secs) } = err {
            return Duration::from_secs(*secs).min(self.max_delay);
        }
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn parse_chat_response(resp: ChatResponse, fallback_model: &str) -> Result<LlmResponse, LlmError> {
    let text = resp
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| LlmError::InvalidResponse("response contained no choices".into()))?;
    let usage = resp
        .usage
        .map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        })
        .unwrap_or_default();
    Ok(LlmResponse {
        text,
        usage,
        model: resp.model.unwrap_or_else(|| fallback_model.to_string()),
    })
}

fn parse_messages_response(
    resp: MessagesResponse,
    fallback_model: &str,
) -> Result<LlmResponse, LlmError> {
    let text: String = resp
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text)
        .collect::<Vec<_>>()
        .join("");
    if text.is_empty() {
        return Err(LlmError::InvalidResponse("response contained no text blocks".into()));
    }
    let usage = resp
        .usage
        .map(|u| TokenUsage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
        })
        .unwrap_or_default();
    Ok(LlmResponse {
        text,
        usage,
        model: resp.model.unwrap_or_else(|| fallback_model.to_string()),
    })
}

// ── HTTP client ──────────────────────────────────────────────────────

pub struct HttpLlmClient {
    name: String,
    section: ProviderSection,
    base_url: String,
    api_key: Option<String>,
    http: Client,
    retry: RetryPolicy,
}

impl HttpLlmClient {
    /// Build a client for a configured provider. The API key is read from the
    /// provider's environment variable.
    pub fn new(name: &str, section: &ProviderSection, retry: RetryPolicy) -> Result<Self, LlmError> {
        let api_key = std::env::var(section.resolved_api_key_env())
            .ok()
            .filter(|k| !k.trim().is_empty());
        Self::with_api_key(name, section, api_key, retry)
    }

    pub fn with_api_key(
        name: &str,
        section: &ProviderSection,
        api_key: Option<String>,
        retry: RetryPolicy,
    ) -> Result<Self, LlmError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(section.request_timeout_secs))
            .build()?;
        Ok(Self {
            name: name.to_string(),
            base_url: section.resolved_base_url(),
            section: section.clone(),
            api_key,
            http,
            retry,
        })
    }

    /// Public endpoints always need a key; self-hosted OpenAI-compatible
    /// servers (Ollama, vLLM) usually don't.
    fn require_key(&self) -> Result<Option<&str>, LlmError> {
        let needs_key = match self.section.kind {
            ProviderKind::Anthropic => true,
            ProviderKind::Openai => self.base_url.contains("api.openai.com"),
        };
        match (&self.api_key, needs_key) {
            (Some(key), _) => Ok(Some(key.as_str())),
            (None, true) => Err(LlmError::MissingApiKey(format!(
                "{} not set",
                self.section.resolved_api_key_env()
            ))),
            (None, false) => Ok(None),
        }
    }

    async fn send_once(
        &self,
        prompt: &EngineeredPrompt,
        options: &CompletionOptions,
    ) -> Result<LlmResponse, LlmError> {
        let key = self.require_key()?;
        let temperature = options.temperature.unwrap_or(self.section.temperature);
        let max_tokens = options.max_tokens.unwrap_or(self.section.max_tokens);

        let builder = match self.section.kind {
            ProviderKind::Openai => {
                let body = ChatRequest {
                    model: &self.section.model,
                    messages: vec![
                        ChatMessage { role: "system".into(), content: prompt.system.clone() },
                        ChatMessage { role: "user".into(), content: prompt.user.clone() },
                    ],
                    temperature,
                    max_tokens,
                };
                let mut b = self
                    .http
                    .post(format!("{}/v1/chat/completions", self.base_url))
                    .json(&body);
                if let Some(key) = key {
                    b = b.bearer_auth(key);
                }
                b
            }
            ProviderKind::Anthropic => {
                let body = MessagesRequest {
                    model: &self.section.model,
                    max_tokens,
                    system: &prompt.system,
                    messages: vec![ChatMessage { role: "user".into(), content: prompt.user.clone() }],
                    temperature,
                };
                let mut b = self
                    .http
                    .post(format!("{}/v1/messages", self.base_url))
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(&body);
                if let Some(key) = key {
                    b = b.header("x-api-key", key);
                }
                b
            }
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            return Err(LlmError::RateLimited { retry_after });
        }
        if status >= 400 {
            let message = response.text().await.unwrap_or_else(|_| "(no body)".into());
            return Err(LlmError::Api { status, message });
        }

        match self.section.kind {
            ProviderKind::Openai => {
                let parsed: ChatResponse = response.json().await.map_err(|e| {
                    LlmError::InvalidResponse(format!("failed to parse response: {e}"))
                })?;
                parse_chat_response(parsed, &self.section.model)
            }
            ProviderKind::Anthropic => {
                let parsed: MessagesResponse = response.json().await.map_err(|e| {
                    LlmError::InvalidResponse(format!("failed to parse response: {e}"))
                })?;
                parse_messages_response(parsed, &self.section.model)
            }
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlmClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.section.model
    }

    async fn complete(
        &self,
        prompt: &EngineeredPrompt,
        options: &CompletionOptions,
    ) -> Result<LlmResponse, LlmError> {
        let mut attempt = 0;
        loop {
            match self.send_once(prompt, options).await {
                Ok(resp) => {
                    debug!(
                        provider = %self.name,
                        model = %resp.model,
                        prompt_tokens = resp.usage.prompt_tokens,
                        completion_tokens = resp.usage.completion_tokens,
                        "LLM call succeeded"
                    );
                    return Ok(resp);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt, &e);
                    warn!(
                        provider = %self.name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "LLM call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// Named providers plus the default used when a request names none.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    default: String,
}

impl ProviderRegistry {
    pub fn new(default: &str) -> Self {
        Self {
            providers: HashMap::new(),
            default: default.to_string(),
        }
    }

    /// A registry with a single provider that is also the default.
    pub fn single(provider: Arc<dyn LlmProvider>) -> Self {
        let mut registry = Self::new(provider.name());
        registry.insert(provider);
        registry
    }

    pub fn from_config(section: &LlmSection) -> Result<Self, LlmError> {
        let retry = RetryPolicy {
            max_retries: section.max_retries,
            base_delay: Duration::from_millis(section.retry_base_delay_ms),
            ..RetryPolicy::default()
        };
        let mut registry = Self::new(&section.default_provider);
        for (name, provider) in &section.providers {
            registry.insert(Arc::new(HttpLlmClient::new(name, provider, retry)?));
        }
        Ok(registry)
    }

    pub fn insert(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn LlmProvider>, LlmError> {
        let name = name.unwrap_or(&self.default);
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| LlmError::UnknownProvider(name.to_string()))
    }
}

// ── Scripted provider ────────────────────────────────────────────────

/// Replays canned responses in order. Used by tests and offline demos.
pub struct ScriptedProvider {
    name: String,
    responses: std::sync::Mutex<VecDeque<Result<String, String>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    prompts: std::sync::Mutex<Vec<EngineeredPrompt>>,
}

impl ScriptedProvider {
    pub fn new(name: &str, responses: Vec<Result<String, String>>) -> Self {
        Self {
            name: name.to_string(),
            responses: std::sync::Mutex::new(responses.into()),
            delay: None,
            calls: AtomicUsize::new(0),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Convenience constructor for successful responses only.
    pub fn replies<S: Into<String>>(name: &str, replies: impl IntoIterator<Item = S>) -> Self {
        Self::new(name, replies.into_iter().map(|r| Ok(r.into())).collect())
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<EngineeredPrompt> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        prompt: &EngineeredPrompt,
        _options: &CompletionOptions,
    ) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .responses
            .lock()
            .map_err(|_| LlmError::InvalidResponse("script lock poisoned".into()))?
            .pop_front();
        match next {
            Some(Ok(text)) => Ok(LlmResponse {
                usage: TokenUsage {
                    prompt_tokens: (prompt.char_len() / 4) as u64,
                    completion_tokens: (text.len() / 4) as u64,
                },
                text,
                model: "scripted".to_string(),
            }),
            Some(Err(message)) => Err(LlmError::Api { status: 500, message }),
            None => Err(LlmError::InvalidResponse("script exhausted".into())),
        }
    }
}
