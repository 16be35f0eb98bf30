use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kibble_core::{
    ApiUsageEntry, NewFact, NewNewsSource, NewStory, NewsRefreshStatus, NewsSource, NewsTopic,
    RefreshLogEntry, RefreshStatus, Topic,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::Repository;

/// Postgres-backed repository. Queries are checked at runtime, not compile time.
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .with_context(|| format!("connecting to {}", redact(database_url)))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

fn redact(database_url: &str) -> String {
    match url::Url::parse(database_url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        _ => database_url.to_string(),
    }
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn topic_from_row(row: &PgRow) -> Result<Topic> {
    Ok(Topic {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        is_active: row.try_get("is_active")?,
        facts_per_refresh: to_u32(row.try_get("facts_per_refresh")?),
        refresh_interval_minutes: to_u32(row.try_get("refresh_interval_minutes")?),
        summary_min_words: to_u32(row.try_get("summary_min_words")?),
        summary_max_words: to_u32(row.try_get("summary_max_words")?),
        last_refreshed_at: row.try_get("last_refreshed_at")?,
        ai_provider: row.try_get("ai_provider")?,
        is_niche: row.try_get("is_niche")?,
    })
}

fn news_topic_from_row(row: &PgRow) -> Result<NewsTopic> {
    Ok(NewsTopic {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        is_active: row.try_get("is_active")?,
        stories_per_refresh: to_u32(row.try_get("stories_per_refresh")?),
        refresh_interval_minutes: to_u32(row.try_get("refresh_interval_minutes")?),
        summary_min_words: to_u32(row.try_get("summary_min_words")?),
        summary_max_words: to_u32(row.try_get("summary_max_words")?),
        last_refreshed_at: row.try_get("last_refreshed_at")?,
        ai_provider: row.try_get("ai_provider")?,
        is_niche: row.try_get("is_niche")?,
    })
}

fn source_from_row(row: &PgRow) -> Result<NewsSource> {
    Ok(NewsSource {
        id: row.try_get("id")?,
        news_topic_id: row.try_get("news_topic_id")?,
        url: row.try_get("url")?,
        name: row.try_get("name")?,
        is_manual: row.try_get("is_manual")?,
        is_active: row.try_get("is_active")?,
        failure_count: to_u32(row.try_get("failure_count")?),
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

const TOPIC_COLUMNS: &str = "id, name, description, is_active, facts_per_refresh, refresh_interval_minutes, \
     summary_min_words, summary_max_words, last_refreshed_at, ai_provider, is_niche";

const NEWS_TOPIC_COLUMNS: &str = "t.id, t.name, t.description, t.is_active, t.stories_per_refresh, \
     t.refresh_interval_minutes, t.summary_min_words, t.summary_max_words, t.last_refreshed_at, \
     t.ai_provider, t.is_niche";

const SOURCE_COLUMNS: &str =
    "id, news_topic_id, url, name, is_manual, is_active, failure_count, last_error, created_at";

#[async_trait]
impl Repository for PgRepository {
    async fn settings_snapshot(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await
            .context("loading settings")?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("key")?, row.try_get("value")?);
        }
        Ok(out)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .context("deleting expired sessions")?;
        Ok(result.rows_affected())
    }

    async fn topics_due_for_refresh(&self, now: DateTime<Utc>) -> Result<Vec<Topic>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TOPIC_COLUMNS}
              FROM topics
             WHERE is_active
               AND (last_refreshed_at IS NULL
                    OR last_refreshed_at + make_interval(mins => refresh_interval_minutes) < $1)
             ORDER BY id
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("querying due topics")?;
        rows.iter().map(topic_from_row).collect()
    }

    async fn get_topic(&self, topic_id: i64) -> Result<Option<Topic>> {
        let row = sqlx::query(&format!("SELECT {TOPIC_COLUMNS} FROM topics WHERE id = $1"))
            .bind(topic_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading topic {topic_id}"))?;
        row.as_ref().map(topic_from_row).transpose()
    }

    async fn touch_topic_refreshed(&self, topic_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE topics SET last_refreshed_at = $2 WHERE id = $1")
            .bind(topic_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .with_context(|| format!("updating refresh time of topic {topic_id}"))?;
        Ok(())
    }

    async fn fact_grams_for_topic(&self, topic_id: i64) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT trigrams FROM facts WHERE topic_id = $1")
            .bind(topic_id)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("loading grams of topic {topic_id}"))?;
        rows.iter()
            .map(|row| row.try_get("trigrams").map_err(Into::into))
            .collect()
    }

    async fn create_fact(&self, fact: NewFact) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO facts (topic_id, content, trigrams, is_custom, ai_provider, ai_model)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(fact.topic_id)
        .bind(&fact.content)
        .bind(&fact.grams)
        .bind(fact.is_custom)
        .bind(&fact.ai_provider)
        .bind(&fact.ai_model)
        .fetch_one(&self.pool)
        .await
        .context("inserting fact")?;
        Ok(row.try_get("id")?)
    }

    async fn news_topics_due_for_refresh(&self, now: DateTime<Utc>) -> Result<Vec<NewsTopic>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {NEWS_TOPIC_COLUMNS}
              FROM news_topics t
              LEFT JOIN news_refresh_status s ON s.news_topic_id = t.id
             WHERE t.is_active
               AND (t.last_refreshed_at IS NULL
                    OR t.last_refreshed_at + make_interval(mins => t.refresh_interval_minutes) < $1)
               AND (s.next_refresh IS NULL OR s.next_refresh <= $1)
             ORDER BY t.id
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("querying due news topics")?;
        rows.iter().map(news_topic_from_row).collect()
    }

    async fn get_news_topic(&self, news_topic_id: i64) -> Result<Option<NewsTopic>> {
        let row = sqlx::query(&format!(
            "SELECT {NEWS_TOPIC_COLUMNS} FROM news_topics t WHERE t.id = $1"
        ))
        .bind(news_topic_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading news topic {news_topic_id}"))?;
        row.as_ref().map(news_topic_from_row).transpose()
    }

    async fn touch_news_topic_refreshed(&self, news_topic_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE news_topics SET last_refreshed_at = $2 WHERE id = $1")
            .bind(news_topic_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .with_context(|| format!("updating refresh time of news topic {news_topic_id}"))?;
        Ok(())
    }

    async fn sources_for_news_topic(&self, news_topic_id: i64) -> Result<Vec<NewsSource>> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM news_sources WHERE news_topic_id = $1 ORDER BY id"
        ))
        .bind(news_topic_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading sources of news topic {news_topic_id}"))?;
        rows.iter().map(source_from_row).collect()
    }

    async fn active_sources_for_news_topic(&self, news_topic_id: i64) -> Result<Vec<NewsSource>> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM news_sources WHERE news_topic_id = $1 AND is_active ORDER BY id"
        ))
        .bind(news_topic_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading active sources of news topic {news_topic_id}"))?;
        rows.iter().map(source_from_row).collect()
    }

    async fn add_news_source(&self, source: NewNewsSource) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO news_sources (news_topic_id, url, name, is_manual)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(source.news_topic_id)
        .bind(&source.url)
        .bind(&source.name)
        .bind(source.is_manual)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("inserting news source {}", source.url))?;
        Ok(row.try_get("id")?)
    }

    async fn delete_news_source(&self, source_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM news_sources WHERE id = $1")
            .bind(source_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting news source {source_id}"))?;
        Ok(())
    }

    async fn clear_discovered_sources(&self, news_topic_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM news_sources WHERE news_topic_id = $1 AND NOT is_manual")
            .bind(news_topic_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("clearing discovered sources of news topic {news_topic_id}"))?;
        Ok(result.rows_affected())
    }

    async fn record_source_failure(&self, source_id: i64, error: &str) -> Result<u32> {
        let row = sqlx::query(
            r#"
            UPDATE news_sources
               SET failure_count = failure_count + 1,
                   last_error = $2
             WHERE id = $1
            RETURNING failure_count
            "#,
        )
        .bind(source_id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("recording failure of news source {source_id}"))?
        .ok_or_else(|| anyhow!("news source {source_id} not found"))?;
        Ok(to_u32(row.try_get("failure_count")?))
    }

    async fn record_source_success(&self, source_id: i64) -> Result<u32> {
        let row = sqlx::query(
            r#"
            UPDATE news_sources
               SET failure_count = GREATEST(failure_count - 1, 0)
             WHERE id = $1
            RETURNING failure_count
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("recording success of news source {source_id}"))?
        .ok_or_else(|| anyhow!("news source {source_id} not found"))?;
        Ok(to_u32(row.try_get("failure_count")?))
    }

    async fn recent_story_titles(&self, news_topic_id: i64, limit: usize) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT title
              FROM stories
             WHERE news_topic_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT $2
            "#,
        )
        .bind(news_topic_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading story titles of news topic {news_topic_id}"))?;
        rows.iter()
            .map(|row| row.try_get("title").map_err(Into::into))
            .collect()
    }

    async fn create_story(&self, story: NewStory) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO stories (news_topic_id, title, summary, source_url, source_title, ai_provider, ai_model)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(story.news_topic_id)
        .bind(&story.title)
        .bind(&story.summary)
        .bind(&story.source_url)
        .bind(&story.source_title)
        .bind(&story.ai_provider)
        .bind(&story.ai_model)
        .fetch_one(&self.pool)
        .await
        .context("inserting story")?;
        Ok(row.try_get("id")?)
    }

    async fn prune_stories(&self, news_topic_id: i64, keep: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM stories
             WHERE news_topic_id = $1
               AND id NOT IN (
                   SELECT id
                     FROM stories
                    WHERE news_topic_id = $1
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2
               )
            "#,
        )
        .bind(news_topic_id)
        .bind(keep as i64)
        .execute(&self.pool)
        .await
        .with_context(|| format!("pruning stories of news topic {news_topic_id}"))?;
        Ok(result.rows_affected())
    }

    async fn upsert_refresh_status(&self, status: NewsRefreshStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO news_refresh_status
                   (news_topic_id, status, last_refresh, next_refresh, error_message, error_kind)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (news_topic_id) DO UPDATE
               SET status = EXCLUDED.status,
                   last_refresh = COALESCE(EXCLUDED.last_refresh, news_refresh_status.last_refresh),
                   next_refresh = EXCLUDED.next_refresh,
                   error_message = EXCLUDED.error_message,
                   error_kind = EXCLUDED.error_kind
            "#,
        )
        .bind(status.news_topic_id)
        .bind(status.status.as_str())
        .bind(status.last_refresh)
        .bind(status.next_refresh)
        .bind(&status.error_message)
        .bind(&status.error_kind)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating refresh status of news topic {}", status.news_topic_id))?;
        Ok(())
    }

    async fn get_refresh_status(&self, news_topic_id: i64) -> Result<Option<NewsRefreshStatus>> {
        let row = sqlx::query(
            r#"
            SELECT news_topic_id, status, last_refresh, next_refresh, error_message, error_kind
              FROM news_refresh_status
             WHERE news_topic_id = $1
            "#,
        )
        .bind(news_topic_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading refresh status of news topic {news_topic_id}"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw_status: String = row.try_get("status")?;
        let status = RefreshStatus::parse(&raw_status)
            .ok_or_else(|| anyhow!("unknown refresh status {raw_status:?}"))?;
        Ok(Some(NewsRefreshStatus {
            news_topic_id: row.try_get("news_topic_id")?,
            status,
            last_refresh: row.try_get("last_refresh")?,
            next_refresh: row.try_get("next_refresh")?,
            error_message: row.try_get("error_message")?,
            error_kind: row.try_get("error_kind")?,
        }))
    }

    async fn log_refresh(&self, entry: RefreshLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_logs
                   (kind, topic_id, topic_name, success, error_kind, error_message,
                    duration_ms, ai_provider, ai_model, item_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.kind.as_str())
        .bind(entry.topic_id)
        .bind(&entry.topic_name)
        .bind(entry.success)
        .bind(&entry.error_kind)
        .bind(&entry.error_message)
        .bind(i64::try_from(entry.duration_ms).unwrap_or(i64::MAX))
        .bind(&entry.ai_provider)
        .bind(&entry.ai_model)
        .bind(i32::try_from(entry.item_count).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await
        .context("inserting refresh log")?;
        Ok(())
    }

    async fn log_api_usage(&self, entry: ApiUsageEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_usage_logs
                   (topic_id, facts_requested, facts_generated, facts_discarded,
                    tokens_used, ai_provider, ai_model, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.topic_id)
        .bind(i32::try_from(entry.facts_requested).unwrap_or(i32::MAX))
        .bind(i32::try_from(entry.facts_generated).unwrap_or(i32::MAX))
        .bind(i32::try_from(entry.facts_discarded).unwrap_or(i32::MAX))
        .bind(i64::try_from(entry.tokens_used).unwrap_or(i64::MAX))
        .bind(&entry.ai_provider)
        .bind(&entry.ai_model)
        .bind(&entry.error_message)
        .execute(&self.pool)
        .await
        .context("inserting api usage log")?;
        Ok(())
    }
}
