use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kibble_core::{
    ApiUsageEntry, Fact, NewFact, NewNewsSource, NewStory, NewsRefreshStatus, NewsSource, NewsTopic,
    RefreshLogEntry, Story, Topic,
};
use serde::Deserialize;

use crate::Repository;

/// Initial data for a [`MemoryRepository`], usually loaded from YAML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemorySeed {
    #[serde(default)]
    pub settings: HashMap<String, String>,
    #[serde(default)]
    pub topics: Vec<Topic>,
    #[serde(default)]
    pub news_topics: Vec<NewsTopic>,
    #[serde(default)]
    pub news_sources: Vec<NewNewsSource>,
}

impl MemorySeed {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("parsing seed yaml")
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed file {}", path.display()))?;
        Self::from_yaml_str(&yaml)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    settings: HashMap<String, String>,
    sessions: Vec<(String, DateTime<Utc>)>,
    topics: BTreeMap<i64, Topic>,
    facts: Vec<Fact>,
    news_topics: BTreeMap<i64, NewsTopic>,
    sources: BTreeMap<i64, NewsSource>,
    stories: Vec<Story>,
    statuses: HashMap<i64, NewsRefreshStatus>,
    refresh_logs: Vec<RefreshLogEntry>,
    api_usage: Vec<ApiUsageEntry>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn source_mut(&mut self, source_id: i64) -> Result<&mut NewsSource> {
        self.sources
            .get_mut(&source_id)
            .ok_or_else(|| anyhow!("news source {source_id} not found"))
    }
}

/// Process-local repository used by tests and seed-file runs.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: MemorySeed) -> Self {
        let repo = Self::new();
        {
            let mut state = repo.state.lock().unwrap_or_else(|p| p.into_inner());
            state.settings = seed.settings;
            for topic in seed.topics {
                state.next_id = state.next_id.max(topic.id);
                state.topics.insert(topic.id, topic);
            }
            for topic in seed.news_topics {
                state.next_id = state.next_id.max(topic.id);
                state.news_topics.insert(topic.id, topic);
            }
            for source in seed.news_sources {
                let id = state.allocate_id();
                state.sources.insert(id, new_source_row(id, source));
            }
        }
        repo
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory repository lock poisoned"))
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.state()?.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn insert_session(&self, id: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.state()?.sessions.push((id.to_string(), expires_at));
        Ok(())
    }

    pub fn session_count(&self) -> Result<usize> {
        Ok(self.state()?.sessions.len())
    }

    pub fn insert_topic(&self, topic: Topic) -> Result<()> {
        let mut state = self.state()?;
        state.next_id = state.next_id.max(topic.id);
        state.topics.insert(topic.id, topic);
        Ok(())
    }

    pub fn insert_news_topic(&self, topic: NewsTopic) -> Result<()> {
        let mut state = self.state()?;
        state.next_id = state.next_id.max(topic.id);
        state.news_topics.insert(topic.id, topic);
        Ok(())
    }

    pub fn facts_for_topic(&self, topic_id: i64) -> Result<Vec<Fact>> {
        Ok(self
            .state()?
            .facts
            .iter()
            .filter(|f| f.topic_id == topic_id)
            .cloned()
            .collect())
    }

    pub fn stories_for_topic(&self, news_topic_id: i64) -> Result<Vec<Story>> {
        Ok(self
            .state()?
            .stories
            .iter()
            .filter(|s| s.news_topic_id == news_topic_id)
            .cloned()
            .collect())
    }

    pub fn source(&self, source_id: i64) -> Result<Option<NewsSource>> {
        Ok(self.state()?.sources.get(&source_id).cloned())
    }

    pub fn refresh_logs(&self) -> Result<Vec<RefreshLogEntry>> {
        Ok(self.state()?.refresh_logs.clone())
    }

    pub fn api_usage(&self) -> Result<Vec<ApiUsageEntry>> {
        Ok(self.state()?.api_usage.clone())
    }
}

fn new_source_row(id: i64, source: NewNewsSource) -> NewsSource {
    NewsSource {
        id,
        news_topic_id: source.news_topic_id,
        url: source.url,
        name: source.name,
        is_manual: source.is_manual,
        is_active: true,
        failure_count: 0,
        last_error: String::new(),
        created_at: Utc::now(),
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn settings_snapshot(&self) -> Result<HashMap<String, String>> {
        Ok(self.state()?.settings.clone())
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state()?;
        let before = state.sessions.len();
        state.sessions.retain(|(_, expires_at)| *expires_at > now);
        Ok((before - state.sessions.len()) as u64)
    }

    async fn topics_due_for_refresh(&self, now: DateTime<Utc>) -> Result<Vec<Topic>> {
        Ok(self
            .state()?
            .topics
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect())
    }

    async fn get_topic(&self, topic_id: i64) -> Result<Option<Topic>> {
        Ok(self.state()?.topics.get(&topic_id).cloned())
    }

    async fn touch_topic_refreshed(&self, topic_id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state()?;
        let topic = state
            .topics
            .get_mut(&topic_id)
            .ok_or_else(|| anyhow!("topic {topic_id} not found"))?;
        topic.last_refreshed_at = Some(at);
        Ok(())
    }

    async fn fact_grams_for_topic(&self, topic_id: i64) -> Result<Vec<String>> {
        Ok(self
            .state()?
            .facts
            .iter()
            .filter(|f| f.topic_id == topic_id)
            .map(|f| f.grams.clone())
            .collect())
    }

    async fn create_fact(&self, fact: NewFact) -> Result<i64> {
        let mut state = self.state()?;
        let id = state.allocate_id();
        state.facts.push(Fact {
            id,
            topic_id: fact.topic_id,
            content: fact.content,
            grams: fact.grams,
            is_custom: fact.is_custom,
            is_archived: false,
            ai_provider: fact.ai_provider,
            ai_model: fact.ai_model,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn news_topics_due_for_refresh(&self, now: DateTime<Utc>) -> Result<Vec<NewsTopic>> {
        let state = self.state()?;
        Ok(state
            .news_topics
            .values()
            .filter(|t| t.is_due(state.statuses.get(&t.id), now))
            .cloned()
            .collect())
    }

    async fn get_news_topic(&self, news_topic_id: i64) -> Result<Option<NewsTopic>> {
        Ok(self.state()?.news_topics.get(&news_topic_id).cloned())
    }

    async fn touch_news_topic_refreshed(&self, news_topic_id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state()?;
        let topic = state
            .news_topics
            .get_mut(&news_topic_id)
            .ok_or_else(|| anyhow!("news topic {news_topic_id} not found"))?;
        topic.last_refreshed_at = Some(at);
        Ok(())
    }

    async fn sources_for_news_topic(&self, news_topic_id: i64) -> Result<Vec<NewsSource>> {
        Ok(self
            .state()?
            .sources
            .values()
            .filter(|s| s.news_topic_id == news_topic_id)
            .cloned()
            .collect())
    }

    async fn active_sources_for_news_topic(&self, news_topic_id: i64) -> Result<Vec<NewsSource>> {
        Ok(self
            .state()?
            .sources
            .values()
            .filter(|s| s.news_topic_id == news_topic_id && s.is_active)
            .cloned()
            .collect())
    }

    async fn add_news_source(&self, source: NewNewsSource) -> Result<i64> {
        let mut state = self.state()?;
        let id = state.allocate_id();
        state.sources.insert(id, new_source_row(id, source));
        Ok(id)
    }

    async fn delete_news_source(&self, source_id: i64) -> Result<()> {
        self.state()?.sources.remove(&source_id);
        Ok(())
    }

    async fn clear_discovered_sources(&self, news_topic_id: i64) -> Result<u64> {
        let mut state = self.state()?;
        let before = state.sources.len();
        state
            .sources
            .retain(|_, s| s.news_topic_id != news_topic_id || s.is_manual);
        Ok((before - state.sources.len()) as u64)
    }

    async fn record_source_failure(&self, source_id: i64, error: &str) -> Result<u32> {
        let mut state = self.state()?;
        let source = state.source_mut(source_id)?;
        source.failure_count = source.failure_count.saturating_add(1);
        source.last_error = error.to_string();
        Ok(source.failure_count)
    }

    async fn record_source_success(&self, source_id: i64) -> Result<u32> {
        let mut state = self.state()?;
        let source = state.source_mut(source_id)?;
        source.failure_count = source.failure_count.saturating_sub(1);
        Ok(source.failure_count)
    }

    async fn recent_story_titles(&self, news_topic_id: i64, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .state()?
            .stories
            .iter()
            .rev()
            .filter(|s| s.news_topic_id == news_topic_id)
            .take(limit)
            .map(|s| s.title.clone())
            .collect())
    }

    async fn create_story(&self, story: NewStory) -> Result<i64> {
        let mut state = self.state()?;
        let id = state.allocate_id();
        state.stories.push(Story {
            id,
            news_topic_id: story.news_topic_id,
            title: story.title,
            summary: story.summary,
            source_url: story.source_url,
            source_title: story.source_title,
            ai_provider: story.ai_provider,
            ai_model: story.ai_model,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn prune_stories(&self, news_topic_id: i64, keep: usize) -> Result<u64> {
        let mut state = self.state()?;
        let mut ids: Vec<i64> = state
            .stories
            .iter()
            .filter(|s| s.news_topic_id == news_topic_id)
            .map(|s| s.id)
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let doomed: Vec<i64> = ids.into_iter().skip(keep).collect();
        state.stories.retain(|s| !doomed.contains(&s.id));
        Ok(doomed.len() as u64)
    }

    async fn upsert_refresh_status(&self, status: NewsRefreshStatus) -> Result<()> {
        self.state()?.statuses.insert(status.news_topic_id, status);
        Ok(())
    }

    async fn get_refresh_status(&self, news_topic_id: i64) -> Result<Option<NewsRefreshStatus>> {
        Ok(self.state()?.statuses.get(&news_topic_id).cloned())
    }

    async fn log_refresh(&self, entry: RefreshLogEntry) -> Result<()> {
        self.state()?.refresh_logs.push(entry);
        Ok(())
    }

    async fn log_api_usage(&self, entry: ApiUsageEntry) -> Result<()> {
        self.state()?.api_usage.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kibble_core::RefreshStatus;
    use std::io::Write;

    const SEED: &str = r#"
settings:
  ai_provider: ollama
  news_tone_instructions: "Keep it neutral."
topics:
  - id: 1
    name: Space
    is_active: true
    facts_per_refresh: 3
    refresh_interval_minutes: 60
news_topics:
  - id: 2
    name: Rust releases
    is_active: true
    stories_per_refresh: 4
    refresh_interval_minutes: 120
news_sources:
  - news_topic_id: 2
    url: https://blog.rust-lang.org/feed.xml
    name: Rust Blog
    is_manual: true
  - news_topic_id: 2
    url: https://this-week-in-rust.org/rss.xml
    name: This Week in Rust
    is_manual: false
"#;

    fn seeded() -> MemoryRepository {
        MemoryRepository::from_seed(MemorySeed::from_yaml_str(SEED).expect("seed"))
    }

    #[tokio::test]
    async fn seed_file_populates_every_table() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(SEED.as_bytes()).expect("write seed");
        let repo = MemoryRepository::from_seed(MemorySeed::from_yaml_file(file.path()).expect("seed"));

        let settings = repo.settings_snapshot().await.expect("settings");
        assert_eq!(settings.get("ai_provider").map(String::as_str), Some("ollama"));
        assert!(repo.get_topic(1).await.expect("topic").is_some());
        assert_eq!(repo.sources_for_news_topic(2).await.expect("sources").len(), 2);

        // Source ids never collide with seeded topic ids.
        let sources = repo.sources_for_news_topic(2).await.expect("sources");
        assert!(sources.iter().all(|s| s.id > 2));
    }

    #[tokio::test]
    async fn failure_count_floors_at_zero() {
        let repo = seeded();
        let source = repo.sources_for_news_topic(2).await.expect("sources")[0].clone();

        assert_eq!(repo.record_source_success(source.id).await.expect("success"), 0);
        assert_eq!(repo.record_source_failure(source.id, "boom").await.expect("fail"), 1);
        assert_eq!(repo.record_source_failure(source.id, "boom").await.expect("fail"), 2);
        assert_eq!(repo.record_source_success(source.id).await.expect("success"), 1);
        assert_eq!(repo.record_source_success(source.id).await.expect("success"), 0);
        assert_eq!(repo.record_source_success(source.id).await.expect("success"), 0);
        assert_eq!(repo.source(source.id).expect("source").expect("row").last_error, "boom");
    }

    #[tokio::test]
    async fn clearing_discovered_sources_keeps_manual_ones() {
        let repo = seeded();
        assert_eq!(repo.clear_discovered_sources(2).await.expect("clear"), 1);
        let left = repo.sources_for_news_topic(2).await.expect("sources");
        assert_eq!(left.len(), 1);
        assert!(left[0].is_manual);
    }

    #[tokio::test]
    async fn prune_keeps_newest_stories() {
        let repo = seeded();
        for i in 0..5 {
            repo.create_story(NewStory {
                news_topic_id: 2,
                title: format!("story {i}"),
                summary: String::new(),
                source_url: String::new(),
                source_title: String::new(),
                ai_provider: "ollama".into(),
                ai_model: "mistral-nemo".into(),
            })
            .await
            .expect("story");
        }

        assert_eq!(repo.prune_stories(2, 3).await.expect("prune"), 2);
        let titles = repo.recent_story_titles(2, 30).await.expect("titles");
        assert_eq!(titles, vec!["story 4", "story 3", "story 2"]);
    }

    #[tokio::test]
    async fn failed_status_with_future_backoff_is_not_due() {
        let repo = seeded();
        let now = Utc::now();
        assert_eq!(repo.news_topics_due_for_refresh(now).await.expect("due").len(), 1);

        repo.upsert_refresh_status(NewsRefreshStatus {
            news_topic_id: 2,
            status: RefreshStatus::Failed,
            last_refresh: Some(now),
            next_refresh: Some(now + chrono::Duration::minutes(5)),
            error_message: "timeout".into(),
            error_kind: Some("timeout".into()),
        })
        .await
        .expect("status");

        assert!(repo.news_topics_due_for_refresh(now).await.expect("due").is_empty());
    }

    #[tokio::test]
    async fn expired_sessions_are_purged() {
        let repo = seeded();
        let now = Utc::now();
        repo.insert_session("old", now - chrono::Duration::hours(1)).expect("session");
        repo.insert_session("fresh", now + chrono::Duration::hours(1)).expect("session");
        assert_eq!(repo.delete_expired_sessions(now).await.expect("purge"), 1);
        assert_eq!(repo.session_count().expect("count"), 1);
    }
}
