//! Concrete chat providers and per-refresh provider selection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kibble_core::{settings, SettingsSnapshot};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{ChatError, ChatMessage, ChatProvider, ChatRequest, ChatResponse, Role};

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub const GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "mistral-nemo";
pub const CHUTES_ENDPOINT: &str = "https://llm.chutes.ai/v1/chat/completions";
pub const DEFAULT_CHUTES_MODEL: &str = "deepseek-ai/DeepSeek-V3";
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(600);

const ERROR_BODY_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gemini,
    Ollama,
    Chutes,
}

impl ProviderKind {
    /// Unknown names fall back to Gemini.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "ollama" => Self::Ollama,
            "chutes" => Self::Chutes,
            _ => Self::Gemini,
        }
    }

    /// Topic override first, then the global `ai_provider` setting.
    pub fn resolve(topic_override: Option<&str>, snapshot: &SettingsSnapshot) -> Self {
        let name = topic_override
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| snapshot.get(settings::AI_PROVIDER));
        Self::from_name(name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
            Self::Chutes => "chutes",
        }
    }
}

/// Picks the provider for one refresh.
pub trait ProviderSelector: Send + Sync {
    fn select(&self, topic_override: Option<&str>, snapshot: &SettingsSnapshot) -> Arc<dyn ChatProvider>;
}

/// Builds providers from the settings snapshot over one shared HTTP client.
#[derive(Clone)]
pub struct ProviderRouter {
    client: reqwest::Client,
    timeout: Duration,
}

impl ProviderRouter {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl ProviderSelector for ProviderRouter {
    fn select(&self, topic_override: Option<&str>, snapshot: &SettingsSnapshot) -> Arc<dyn ChatProvider> {
        match ProviderKind::resolve(topic_override, snapshot) {
            ProviderKind::Gemini => Arc::new(
                GeminiProvider::new(self.client.clone(), snapshot.get(settings::GEMINI_API_KEY))
                    .with_timeout(self.timeout),
            ),
            ProviderKind::Ollama => Arc::new(
                OpenAiCompatProvider::ollama(
                    self.client.clone(),
                    snapshot.get_or(settings::OLLAMA_URL, DEFAULT_OLLAMA_URL),
                    snapshot.get_or(settings::OLLAMA_MODEL, DEFAULT_OLLAMA_MODEL),
                )
                .with_timeout(self.timeout),
            ),
            ProviderKind::Chutes => Arc::new(
                OpenAiCompatProvider::chutes(
                    self.client.clone(),
                    snapshot.get(settings::CHUTES_API_KEY),
                    snapshot.get_or(settings::CHUTES_MODEL, DEFAULT_CHUTES_MODEL),
                )
                .with_timeout(self.timeout),
            ),
        }
    }
}

fn truncate_body(mut body: String) -> String {
    if let Some((cut, _)) = body.char_indices().nth(ERROR_BODY_LIMIT) {
        body.truncate(cut);
    }
    body
}

async fn read_success(provider: &str, response: reqwest::Response) -> Result<Vec<u8>, ChatError> {
    let status = response.status();
    let body = response.bytes().await.map_err(|source| ChatError::Request {
        provider: provider.to_string(),
        source,
    })?;
    if !status.is_success() {
        return Err(ChatError::Status {
            provider: provider.to_string(),
            status: status.as_u16(),
            body: truncate_body(String::from_utf8_lossy(&body).into_owned()),
        });
    }
    Ok(body.to_vec())
}

fn decode<T: serde::de::DeserializeOwned>(provider: &str, body: &[u8]) -> Result<T, ChatError> {
    serde_json::from_slice(body).map_err(|e| ChatError::Parse {
        what: "provider response",
        provider: provider.to_string(),
        reason: e.to_string(),
    })
}

/// Flattens role-tagged messages into one prompt; system messages get a blank line after them.
pub fn messages_to_prompt(messages: &[ChatMessage]) -> String {
    if let [only] = messages {
        return only.content.clone();
    }
    let mut out = String::new();
    for message in messages {
        out.push_str(&message.content);
        out.push_str(if message.role == Role::System { "\n\n" } else { "\n" });
    }
    out
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    total_token_count: u64,
}

fn gemini_request(request: &ChatRequest) -> GeminiRequest {
    GeminiRequest {
        contents: vec![GeminiContent {
            parts: vec![GeminiPart {
                text: messages_to_prompt(&request.messages),
            }],
        }],
        generation_config: GeminiGenerationConfig {
            temperature: request.temperature,
            max_output_tokens: request.max_tokens,
            response_mime_type: request.json_mode.then_some("application/json"),
        },
    }
}

/// Text of the first candidate plus total token usage.
fn gemini_output(response: GeminiResponse) -> (String, u64) {
    let text = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| content.parts.into_iter().map(|p| p.text).collect::<String>())
        .unwrap_or_default();
    let tokens = response.usage_metadata.map(|u| u.total_token_count).unwrap_or(0);
    (text, tokens)
}

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl GeminiProvider {
    pub fn new(client: reqwest::Client, api_key: &str) -> Self {
        Self {
            client,
            api_key: api_key.trim().to_string(),
            model: GEMINI_MODEL.to_string(),
            base_url: GEMINI_BASE_URL.to_string(),
            timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        if self.api_key.is_empty() {
            return Err(ChatError::NotConfigured("gemini"));
        }
        let started = Instant::now();
        info!(provider = "gemini", model = %self.model, prompt_chars = request.prompt_chars(), json_mode = request.json_mode, "chat request starting");

        let url = format!("{}/{}:generateContent", self.base_url, self.model);
        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .timeout(self.timeout)
            .json(&gemini_request(request))
            .send()
            .await
            .map_err(|source| ChatError::Request {
                provider: "gemini".to_string(),
                source,
            })?;
        let body = read_success("gemini", response).await?;
        let (content, tokens_used) = gemini_output(decode("gemini", &body)?);

        info!(provider = "gemini", tokens_used, elapsed_ms = started.elapsed().as_millis() as u64, "chat request finished");
        Ok(ChatResponse {
            content,
            tokens_used,
            model: self.model.clone(),
            provider: "gemini".to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    total_tokens: u64,
}

/// Any `/v1/chat/completions` endpoint: a local Ollama server or the hosted Chutes API.
pub struct OpenAiCompatProvider {
    name: &'static str,
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl OpenAiCompatProvider {
    pub fn ollama(client: reqwest::Client, base_url: &str, model: &str) -> Self {
        Self {
            name: "ollama",
            client,
            endpoint: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
            api_key: None,
            model: model.to_string(),
            timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    /// The key is required; an empty one fails every request.
    pub fn chutes(client: reqwest::Client, api_key: &str, model: &str) -> Self {
        Self {
            name: "chutes",
            client,
            endpoint: CHUTES_ENDPOINT.to_string(),
            api_key: Some(api_key.trim().to_string()),
            model: model.to_string(),
            timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn completion_request<'a>(&'a self, request: &'a ChatRequest) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
            response_format: request.json_mode.then_some(ResponseFormat { kind: "json_object" }),
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        if matches!(&self.api_key, Some(key) if key.is_empty()) {
            return Err(ChatError::NotConfigured(self.name));
        }
        let started = Instant::now();
        info!(provider = self.name, model = %self.model, prompt_chars = request.prompt_chars(), json_mode = request.json_mode, "chat request starting");

        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&self.completion_request(request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|source| ChatError::Request {
            provider: self.name.to_string(),
            source,
        })?;
        let body = read_success(self.name, response).await?;
        let parsed: CompletionResponse = decode(self.name, &body)?;

        let tokens_used = parsed.usage.map(|u| u.total_tokens).unwrap_or(0);
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        let model = if parsed.model.is_empty() {
            self.model.clone()
        } else {
            parsed.model
        };

        info!(provider = self.name, tokens_used, elapsed_ms = started.elapsed().as_millis() as u64, "chat request finished");
        Ok(ChatResponse {
            content,
            tokens_used,
            model,
            provider: self.name.to_string(),
        })
    }
}
