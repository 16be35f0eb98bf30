//! Core domain model for the Kibble refresh pipeline.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "kibble-core";

/// Cumulative scrape failures at which a news source is deleted.
pub const SOURCE_REMOVAL_THRESHOLD: u32 = 3;

/// Settings keys consulted by the refresh pipelines.
pub mod settings {
    pub const AI_PROVIDER: &str = "ai_provider";
    pub const GEMINI_API_KEY: &str = "gemini_api_key";
    pub const OLLAMA_URL: &str = "ollama_url";
    pub const OLLAMA_MODEL: &str = "ollama_model";
    pub const CHUTES_API_KEY: &str = "chutes_api_key";
    pub const CHUTES_MODEL: &str = "chutes_model";
    pub const AI_CUSTOM_INSTRUCTIONS: &str = "ai_custom_instructions";
    pub const AI_TONE_INSTRUCTIONS: &str = "ai_tone_instructions";
    pub const NEWS_SOURCING_INSTRUCTIONS: &str = "news_sourcing_instructions";
    pub const NEWS_SUMMARIZING_INSTRUCTIONS: &str = "news_summarizing_instructions";
    pub const NEWS_TONE_INSTRUCTIONS: &str = "news_tone_instructions";

    pub const ALL: &[&str] = &[
        AI_PROVIDER,
        GEMINI_API_KEY,
        OLLAMA_URL,
        OLLAMA_MODEL,
        CHUTES_API_KEY,
        CHUTES_MODEL,
        AI_CUSTOM_INSTRUCTIONS,
        AI_TONE_INSTRUCTIONS,
        NEWS_SOURCING_INSTRUCTIONS,
        NEWS_SUMMARIZING_INSTRUCTIONS,
        NEWS_TONE_INSTRUCTIONS,
    ];
}

/// Read-only copy of the settings table taken at the start of one refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsSnapshot(HashMap<String, String>);

impl SettingsSnapshot {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self(values)
    }

    /// Trimmed value, empty when the key is missing.
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(|v| v.trim()).unwrap_or_default()
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.get(key) {
            "" => default,
            value => value,
        }
    }
}

impl From<HashMap<String, String>> for SettingsSnapshot {
    fn from(values: HashMap<String, String>) -> Self {
        Self(values)
    }
}

/// A facts topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub is_active: bool,
    pub facts_per_refresh: u32,
    pub refresh_interval_minutes: u32,
    #[serde(default)]
    pub summary_min_words: u32,
    #[serde(default)]
    pub summary_max_words: u32,
    #[serde(default)]
    pub last_refreshed_at: Option<DateTime<Utc>>,
    /// Per-topic provider override; `None` means use the global setting.
    #[serde(default)]
    pub ai_provider: Option<String>,
    #[serde(default)]
    pub is_niche: bool,
}

impl Topic {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && interval_elapsed(self.last_refreshed_at, self.refresh_interval_minutes, now)
    }
}

/// A persisted fact. `grams` is the JSON array of the fact's n-gram set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub topic_id: i64,
    pub content: String,
    pub grams: String,
    pub is_custom: bool,
    pub is_archived: bool,
    pub ai_provider: String,
    pub ai_model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFact {
    pub topic_id: i64,
    pub content: String,
    pub grams: String,
    pub is_custom: bool,
    pub ai_provider: String,
    pub ai_model: String,
}

/// Minimal view of a fact used for similarity comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredGrams {
    pub fact_id: i64,
    pub grams: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsTopic {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub is_active: bool,
    pub stories_per_refresh: u32,
    pub refresh_interval_minutes: u32,
    #[serde(default)]
    pub summary_min_words: u32,
    #[serde(default)]
    pub summary_max_words: u32,
    #[serde(default)]
    pub last_refreshed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ai_provider: Option<String>,
    #[serde(default)]
    pub is_niche: bool,
}

impl NewsTopic {
    /// Due when the interval elapsed and any failure backoff in `status` has passed.
    pub fn is_due(&self, status: Option<&NewsRefreshStatus>, now: DateTime<Utc>) -> bool {
        if !self.is_active || !interval_elapsed(self.last_refreshed_at, self.refresh_interval_minutes, now) {
            return false;
        }
        match status.and_then(|s| s.next_refresh) {
            Some(next) => next <= now,
            None => true,
        }
    }
}

fn interval_elapsed(last: Option<DateTime<Utc>>, interval_minutes: u32, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(last) => now > last + Duration::minutes(i64::from(interval_minutes)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsSource {
    pub id: i64,
    pub news_topic_id: i64,
    pub url: String,
    pub name: String,
    pub is_manual: bool,
    pub is_active: bool,
    pub failure_count: u32,
    #[serde(default)]
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNewsSource {
    pub news_topic_id: i64,
    pub url: String,
    pub name: String,
    pub is_manual: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: i64,
    pub news_topic_id: i64,
    pub title: String,
    pub summary: String,
    pub source_url: String,
    pub source_title: String,
    pub ai_provider: String,
    pub ai_model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStory {
    pub news_topic_id: i64,
    pub title: String,
    pub summary: String,
    pub source_url: String,
    pub source_title: String,
    pub ai_provider: String,
    pub ai_model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RefreshStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally observable refresh state of one news topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsRefreshStatus {
    pub news_topic_id: i64,
    pub status: RefreshStatus,
    pub last_refresh: Option<DateTime<Utc>>,
    pub next_refresh: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: String,
    /// Classified error code, see `kibble_sync::ErrorKind`.
    #[serde(default)]
    pub error_kind: Option<String>,
}

impl NewsRefreshStatus {
    pub fn in_progress(news_topic_id: i64) -> Self {
        Self {
            news_topic_id,
            status: RefreshStatus::InProgress,
            last_refresh: None,
            next_refresh: None,
            error_message: String::new(),
            error_kind: None,
        }
    }
}

/// Which pipeline a refresh belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshKind {
    Facts,
    News,
}

impl RefreshKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Facts => "facts",
            Self::News => "news",
        }
    }
}

/// Unvalidated source suggestion, as returned by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSource {
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Normalized output of one extraction pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedContent {
    pub url: String,
    pub source_name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshLogEntry {
    pub kind: RefreshKind,
    pub topic_id: i64,
    pub topic_name: String,
    pub success: bool,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub ai_provider: String,
    pub ai_model: String,
    pub item_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiUsageEntry {
    pub topic_id: Option<i64>,
    pub facts_requested: u32,
    pub facts_generated: u32,
    pub facts_discarded: u32,
    pub tokens_used: u64,
    pub ai_provider: String,
    pub ai_model: String,
    #[serde(default)]
    pub error_message: Option<String>,
}
