//! Chat providers, prompt construction and response parsing for generated facts and stories.

use std::sync::Arc;

use async_trait::async_trait;
use kibble_adapters::{CatalogFeed, DomainRank};
use kibble_core::{CandidateSource, ScrapedContent};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod prompts;
pub mod providers;
pub mod research;

pub use prompts::{clean_json_response, extract_json, parse_numbered_list};
pub use providers::{
    GeminiProvider, OpenAiCompatProvider, ProviderKind, ProviderRouter, ProviderSelector,
};
pub use research::{ResearchSource, WikipediaClient};

pub const CRATE_NAME: &str = "kibble-ai";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Hint that the caller expects a JSON document back.
    pub json_mode: bool,
}

impl ChatRequest {
    pub fn prompt(prompt: impl Into<String>, temperature: f32, max_tokens: u32) -> Self {
        Self {
            messages: vec![ChatMessage::user(prompt)],
            temperature,
            max_tokens,
            json_mode: false,
        }
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResponse {
    pub content: String,
    pub tokens_used: u64,
    pub model: String,
    pub provider: String,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0} API key not configured")]
    NotConfigured(&'static str),
    #[error("{provider} request failed: {source}")]
    Request {
        provider: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} returned status {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("empty response from {0}")]
    EmptyResponse(String),
    #[error("no parseable facts in response from {0}")]
    NoFacts(String),
    #[error("failed to parse {what} JSON from {provider}: {reason}")]
    Parse {
        what: &'static str,
        provider: String,
        reason: String,
    },
}

/// Anything that can answer a chat completion.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError>;
}

/// Parsed provider output plus the attribution every persisted row carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Generated<T> {
    pub value: T,
    pub tokens_used: u64,
    pub provider: String,
    pub model: String,
}

impl<T> Generated<T> {
    fn from_response(value: T, response: &ChatResponse) -> Self {
        Self {
            value,
            tokens_used: response.tokens_used,
            provider: response.provider.clone(),
            model: response.model.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FactsRequest<'a> {
    pub topic_name: &'a str,
    pub description: &'a str,
    pub count: u32,
    pub custom_instructions: &'a str,
    pub tone_instructions: &'a str,
    pub min_words: u32,
    pub max_words: u32,
    pub research: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryRequest<'a> {
    pub topic_name: &'a str,
    pub description: &'a str,
    pub sourcing_instructions: &'a str,
    pub catalog: &'a [CatalogFeed],
    pub community_domains: &'a [DomainRank],
    pub research: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct SummarizeRequest<'a> {
    pub topic_name: &'a str,
    pub count: u32,
    pub summarizing_instructions: &'a str,
    pub tone_instructions: &'a str,
    pub min_words: u32,
    pub max_words: u32,
    pub contents: &'a [ScrapedContent],
    pub recent_titles: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizedStory {
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub source_title: String,
}

/// Turns provider completions into facts, candidate sources and stories.
#[derive(Clone, Default)]
pub struct AiClient {
    research: Option<Arc<dyn ResearchSource>>,
}

impl AiClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_research(mut self, research: Arc<dyn ResearchSource>) -> Self {
        self.research = Some(research);
        self
    }

    pub async fn generate_facts(
        &self,
        provider: &dyn ChatProvider,
        request: &FactsRequest<'_>,
    ) -> Result<Generated<Vec<String>>, ChatError> {
        let prompt = prompts::facts_prompt(request);
        let response = provider.chat(&ChatRequest::prompt(prompt, 0.9, 2048)).await?;
        let facts = parse_numbered_list(&response.content);
        if facts.is_empty() {
            return Err(ChatError::NoFacts(response.provider));
        }
        debug!(topic = request.topic_name, parsed = facts.len(), "parsed facts");
        Ok(Generated::from_response(facts, &response))
    }

    pub async fn discover_sources(
        &self,
        provider: &dyn ChatProvider,
        request: &DiscoveryRequest<'_>,
    ) -> Result<Generated<Vec<CandidateSource>>, ChatError> {
        let prompt = prompts::discovery_prompt(request);
        let response = provider.chat(&ChatRequest::prompt(prompt, 0.7, 2048).json()).await?;
        let sources: Vec<CandidateSource> = parse_json_list(&response, "sources")?;
        let sources = sources
            .into_iter()
            .filter(|s| !s.url.trim().is_empty())
            .collect::<Vec<_>>();
        info!(topic = request.topic_name, candidates = sources.len(), "provider suggested sources");
        Ok(Generated::from_response(sources, &response))
    }

    /// Returns no stories without calling the provider when there is no content.
    pub async fn summarize(
        &self,
        provider: &dyn ChatProvider,
        request: &SummarizeRequest<'_>,
    ) -> Result<Generated<Vec<SummarizedStory>>, ChatError> {
        if request.contents.is_empty() {
            return Ok(Generated {
                value: Vec::new(),
                tokens_used: 0,
                provider: provider.name().to_string(),
                model: String::new(),
            });
        }
        let prompt = prompts::summarize_prompt(request);
        let response = provider.chat(&ChatRequest::prompt(prompt, 0.7, 4096).json()).await?;
        let mut stories: Vec<SummarizedStory> = parse_json_list(&response, "stories")?;
        stories.retain(|s| !s.title.trim().is_empty());
        stories.truncate(request.count as usize);
        Ok(Generated::from_response(stories, &response))
    }

    /// Asks the provider for search queries, falling back to the topic name.
    pub async fn search_queries(&self, provider: &dyn ChatProvider, topic_name: &str, description: &str) -> Vec<String> {
        let prompt = prompts::search_queries_prompt(topic_name, description);
        match provider.chat(&ChatRequest::prompt(prompt, 0.5, 256)).await {
            Ok(response) => {
                let queries = parse_numbered_list(&response.content);
                if queries.is_empty() {
                    vec![topic_name.to_string()]
                } else {
                    queries
                }
            }
            Err(err) => {
                warn!(topic = topic_name, error = %err, "search query generation failed");
                vec![topic_name.to_string()]
            }
        }
    }

    /// Background material for niche topics. `None` when research is
    /// unavailable or found nothing; callers then use the plain prompt.
    pub async fn research_topic(
        &self,
        provider: &dyn ChatProvider,
        topic_name: &str,
        description: &str,
    ) -> Option<String> {
        let research = self.research.as_ref()?;
        let queries = self.search_queries(provider, topic_name, description).await;
        match research::gather(research.as_ref(), topic_name, &queries).await {
            Ok(material) => {
                info!(topic = topic_name, chars = material.len(), "research material gathered");
                Some(material)
            }
            Err(err) => {
                warn!(topic = topic_name, error = %err, "research failed, using plain prompt");
                None
            }
        }
    }
}

/// Parses a JSON array out of a completion. Object wrappers such as
/// `{"sources": [...]}` are unwrapped to their first array field.
fn parse_json_list<T: serde::de::DeserializeOwned>(
    response: &ChatResponse,
    what: &'static str,
) -> Result<Vec<T>, ChatError> {
    if response.content.trim().is_empty() {
        return Err(ChatError::EmptyResponse(response.provider.clone()));
    }
    let parse_error = |reason: String| ChatError::Parse {
        what,
        provider: response.provider.clone(),
        reason,
    };

    let json = extract_json(&response.content);
    let value: serde_json::Value = serde_json::from_str(&json).map_err(|e| parse_error(e.to_string()))?;
    let array = match value {
        serde_json::Value::Array(items) => serde_json::Value::Array(items),
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(_, v)| v)
            .find(serde_json::Value::is_array)
            .ok_or_else(|| parse_error("expected a JSON array".to_string()))?,
        _ => return Err(parse_error("expected a JSON array".to_string())),
    };
    serde_json::from_value(array).map_err(|e| parse_error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedProvider {
        reply: String,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(ChatResponse {
                content: self.reply.clone(),
                tokens_used: 42,
                model: "test-model".into(),
                provider: "scripted".into(),
            })
        }
    }

    #[tokio::test]
    async fn facts_are_parsed_from_a_numbered_list() {
        let provider = ScriptedProvider::new("1. Mars has two moons.\n\n2) Venus spins backwards.\n- Saturn could float.");
        let facts = AiClient::new()
            .generate_facts(
                &provider,
                &FactsRequest {
                    topic_name: "Space",
                    count: 3,
                    ..FactsRequest::default()
                },
            )
            .await
            .expect("facts");
        assert_eq!(
            facts.value,
            vec!["Mars has two moons.", "Venus spins backwards.", "Saturn could float."]
        );
        assert_eq!(facts.tokens_used, 42);
        assert_eq!(facts.model, "test-model");

        let seen = provider.seen.lock().unwrap();
        assert!(!seen[0].json_mode);
        assert_eq!(seen[0].max_tokens, 2048);
    }

    #[tokio::test]
    async fn blank_fact_output_is_an_error() {
        let provider = ScriptedProvider::new("   \n\n");
        let err = AiClient::new()
            .generate_facts(&provider, &FactsRequest::default())
            .await
            .expect_err("nothing to parse");
        assert!(err.to_string().contains("no parseable facts"));
    }

    #[tokio::test]
    async fn discovery_tolerates_fences_and_wrappers() {
        let fenced = "```json\n[{\"url\":\"https://a.org/feed\",\"name\":\"A\",\"description\":\"d\"},{\"url\":\"\"}]\n```";
        let found = AiClient::new()
            .discover_sources(&ScriptedProvider::new(fenced), &DiscoveryRequest::default())
            .await
            .expect("sources");
        assert_eq!(found.value.len(), 1);
        assert_eq!(found.value[0].url, "https://a.org/feed");

        let wrapped = r#"{"sources": [{"url": "https://b.org/rss", "name": "B"}]}"#;
        let found = AiClient::new()
            .discover_sources(&ScriptedProvider::new(wrapped), &DiscoveryRequest::default())
            .await
            .expect("wrapped sources");
        assert_eq!(found.value[0].name, "B");
    }

    #[tokio::test]
    async fn unparseable_stories_are_a_parse_error() {
        let contents = vec![ScrapedContent {
            url: "https://a.org".into(),
            source_name: "A".into(),
            content: "text".into(),
        }];
        let err = AiClient::new()
            .summarize(
                &ScriptedProvider::new("Sorry, I cannot help with that."),
                &SummarizeRequest {
                    count: 3,
                    contents: &contents,
                    ..SummarizeRequest::default()
                },
            )
            .await
            .expect_err("prose is not json");
        assert!(err.to_string().starts_with("failed to parse stories JSON from scripted"));
    }

    #[tokio::test]
    async fn summarize_without_content_skips_the_provider() {
        let provider = ScriptedProvider::new("[]");
        let stories = AiClient::new()
            .summarize(&provider, &SummarizeRequest::default())
            .await
            .expect("empty");
        assert!(stories.value.is_empty());
        assert!(provider.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stories_are_capped_at_the_requested_count() {
        let reply = r#"[{"title":"One","summary":"s"},{"title":"Two"},{"title":" "},{"title":"Three"}]"#;
        let contents = vec![ScrapedContent {
            url: "https://a.org".into(),
            source_name: "A".into(),
            content: "text".into(),
        }];
        let stories = AiClient::new()
            .summarize(
                &ScriptedProvider::new(reply),
                &SummarizeRequest {
                    count: 2,
                    contents: &contents,
                    ..SummarizeRequest::default()
                },
            )
            .await
            .expect("stories");
        let titles: Vec<_> = stories.value.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["One", "Two"]);
    }

    #[tokio::test]
    async fn search_queries_fall_back_to_topic_name() {
        let queries = AiClient::new()
            .search_queries(&ScriptedProvider::new(""), "Tardigrades", "")
            .await;
        assert_eq!(queries, vec!["Tardigrades"]);
    }
}
