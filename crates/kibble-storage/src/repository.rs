use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kibble_core::{
    ApiUsageEntry, NewFact, NewNewsSource, NewStory, NewsRefreshStatus, NewsSource, NewsTopic,
    RefreshLogEntry, Topic,
};

/// Everything the refresh core reads from or writes to persistent storage.
///
/// Failure counters are adjusted atomically by the implementation and the new
/// value is returned, so callers never read-modify-write them.
#[async_trait]
pub trait Repository: Send + Sync {
    /// All settings as one consistent snapshot.
    async fn settings_snapshot(&self) -> Result<HashMap<String, String>>;

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn topics_due_for_refresh(&self, now: DateTime<Utc>) -> Result<Vec<Topic>>;
    async fn get_topic(&self, topic_id: i64) -> Result<Option<Topic>>;
    async fn touch_topic_refreshed(&self, topic_id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Serialized gram sets of every fact already stored for the topic.
    async fn fact_grams_for_topic(&self, topic_id: i64) -> Result<Vec<String>>;
    async fn create_fact(&self, fact: NewFact) -> Result<i64>;

    async fn news_topics_due_for_refresh(&self, now: DateTime<Utc>) -> Result<Vec<NewsTopic>>;
    async fn get_news_topic(&self, news_topic_id: i64) -> Result<Option<NewsTopic>>;
    async fn touch_news_topic_refreshed(&self, news_topic_id: i64, at: DateTime<Utc>) -> Result<()>;

    async fn sources_for_news_topic(&self, news_topic_id: i64) -> Result<Vec<NewsSource>>;
    async fn active_sources_for_news_topic(&self, news_topic_id: i64) -> Result<Vec<NewsSource>>;
    async fn add_news_source(&self, source: NewNewsSource) -> Result<i64>;
    async fn delete_news_source(&self, source_id: i64) -> Result<()>;
    /// Removes discovered (non-manual) sources; manual sources are kept.
    async fn clear_discovered_sources(&self, news_topic_id: i64) -> Result<u64>;
    /// Increments the failure count, stores the error text and returns the new count.
    async fn record_source_failure(&self, source_id: i64, error: &str) -> Result<u32>;
    /// Decrements the failure count (never below zero) and returns the new count.
    async fn record_source_success(&self, source_id: i64) -> Result<u32>;

    async fn recent_story_titles(&self, news_topic_id: i64, limit: usize) -> Result<Vec<String>>;
    async fn create_story(&self, story: NewStory) -> Result<i64>;
    /// Keeps the newest `keep` stories of the topic and deletes the rest.
    async fn prune_stories(&self, news_topic_id: i64, keep: usize) -> Result<u64>;

    async fn upsert_refresh_status(&self, status: NewsRefreshStatus) -> Result<()>;
    async fn get_refresh_status(&self, news_topic_id: i64) -> Result<Option<NewsRefreshStatus>>;

    async fn log_refresh(&self, entry: RefreshLogEntry) -> Result<()>;
    async fn log_api_usage(&self, entry: ApiUsageEntry) -> Result<()>;
}
