//! Refresh orchestration: the periodic scheduler, per-item locking and the
//! facts and news pipelines.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use kibble_adapters::{CandidateValidator, ContentExtractor, RedditClient, SocialThreadClient, SourceScraper, SourceValidator};
use kibble_ai::{AiClient, ProviderRouter, ProviderSelector, WikipediaClient};
use kibble_core::{ApiUsageEntry, NewsTopic, RefreshLogEntry, SettingsSnapshot, Topic};
use kibble_storage::{HttpClientConfig, HttpFetcher, Repository};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod classify;
pub mod config;
pub mod discovery;
pub mod facts;
pub mod locks;
pub mod news;
pub mod similarity;

pub use classify::{classify, ErrorKind};
pub use config::SchedulerConfig;
pub use discovery::{DiscoveryMode, DiscoveryReport, SourceDiscovery};
pub use facts::FactsRefreshReport;
pub use locks::{KeyedLocks, RefreshGuard, RefreshKey};
pub use news::NewsRefreshReport;
pub use similarity::{jaccard, normalize, GramSet, SimilarityEngine};

pub const CRATE_NAME: &str = "kibble-sync";

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("{what} is already being refreshed")]
    AlreadyRefreshing { what: &'static str, id: i64 },
    #[error("topic {0} not found")]
    TopicNotFound(i64),
    #[error("news topic {0} not found")]
    NewsTopicNotFound(i64),
    #[error("{message}")]
    Failed { kind: ErrorKind, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RefreshError {
    /// Classified code for failures, `None` for busy or missing items.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            Self::Other(err) => Some(classify(&format!("{err:#}"))),
            _ => None,
        }
    }
}

/// Everything outside the core that a refresh talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub repo: Arc<dyn Repository>,
    pub providers: Arc<dyn ProviderSelector>,
    pub scraper: Arc<dyn SourceScraper>,
    pub validator: Arc<dyn CandidateValidator>,
    pub social: Arc<dyn SocialThreadClient>,
    pub ai: AiClient,
}

impl Collaborators {
    /// Live adapters over one shared HTTP client.
    pub fn live(config: &SchedulerConfig, repo: Arc<dyn Repository>) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..HttpClientConfig::default()
        })?);
        let social: Arc<dyn SocialThreadClient> = Arc::new(RedditClient::new(http.clone()));
        let scraper: Arc<dyn SourceScraper> = Arc::new(ContentExtractor::new(http.clone(), social.clone()));
        let validator = SourceValidator::new(http.clone(), scraper.clone()).with_timeout(config.validation_timeout);
        Ok(Self {
            repo,
            providers: Arc::new(ProviderRouter::new(http.client().clone())),
            scraper,
            validator: Arc::new(validator),
            social,
            ai: AiClient::new().with_research(Arc::new(WikipediaClient::new(http))),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub sessions_purged: u64,
    pub facts_due: usize,
    pub news_due: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub skipped: usize,
}

enum UnitOutcome {
    Refreshed,
    Failed,
    Skipped,
}

pub(crate) struct SchedulerInner {
    pub(crate) collab: Collaborators,
    pub(crate) config: SchedulerConfig,
    pub(crate) similarity: SimilarityEngine,
    locks: KeyedLocks,
    fact_slots: Arc<Semaphore>,
    news_slots: Arc<Semaphore>,
}

/// Periodic driver for facts and news refreshes. Cheap to clone; clones share
/// locks and concurrency limits.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(collab: Collaborators, config: SchedulerConfig) -> Self {
        let similarity = SimilarityEngine::new(config.ngram_size, config.similarity_threshold);
        let fact_slots = Arc::new(Semaphore::new(config.fact_concurrency.max(1)));
        let news_slots = Arc::new(Semaphore::new(config.news_concurrency.max(1)));
        Self {
            inner: Arc::new(SchedulerInner {
                collab,
                config,
                similarity,
                locks: KeyedLocks::new(),
                fact_slots,
                news_slots,
            }),
        }
    }

    pub fn from_config(config: SchedulerConfig, repo: Arc<dyn Repository>) -> Result<Self> {
        let collab = Collaborators::live(&config, repo).context("building live collaborators")?;
        Ok(Self::new(collab, config))
    }

    pub fn is_refreshing(&self, key: RefreshKey) -> bool {
        self.inner.locks.is_locked(key)
    }

    /// Ticks once immediately, then on every interval until `cancel` fires.
    /// Ticks run in the background so a slow refresh never delays the next
    /// check; in-flight ticks are awaited before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.inner.config.tick_interval;
        info!(tick_secs = period.as_secs(), "scheduler started");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let this = self.clone();
                    let cancel = cancel.clone();
                    in_flight.spawn(async move { this.tick(&cancel).await });
                }
                Some(done) = in_flight.join_next(), if !in_flight.is_empty() => log_tick(done),
            }
        }

        info!(in_flight = in_flight.len(), "scheduler stopping");
        while let Some(done) = in_flight.join_next().await {
            log_tick(done);
        }
        info!("scheduler stopped");
    }

    /// One check: purge sessions, then refresh every due facts and news topic
    /// under the configured concurrency limits. Busy items are skipped.
    pub async fn tick(&self, cancel: &CancellationToken) -> TickSummary {
        let repo = &self.inner.collab.repo;
        let now = Utc::now();
        let mut summary = TickSummary::default();

        match repo.delete_expired_sessions(now).await {
            Ok(purged) => summary.sessions_purged = purged,
            Err(err) => warn!(error = %err, "failed to purge expired sessions"),
        }
        let topics = repo.topics_due_for_refresh(now).await.unwrap_or_else(|err| {
            warn!(error = %err, "failed to list due topics");
            Vec::new()
        });
        let news_topics = repo.news_topics_due_for_refresh(now).await.unwrap_or_else(|err| {
            warn!(error = %err, "failed to list due news topics");
            Vec::new()
        });
        summary.facts_due = topics.len();
        summary.news_due = news_topics.len();
        if !topics.is_empty() || !news_topics.is_empty() {
            info!(facts = topics.len(), news = news_topics.len(), "refreshing due topics");
        }

        let mut units = JoinSet::new();
        for topic in topics {
            let this = self.clone();
            let cancel = cancel.clone();
            units.spawn(async move { this.scheduled_facts(topic, &cancel).await });
        }
        for topic in news_topics {
            let this = self.clone();
            let cancel = cancel.clone();
            units.spawn(async move { this.scheduled_news(topic, &cancel).await });
        }

        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(UnitOutcome::Refreshed) => summary.refreshed += 1,
                Ok(UnitOutcome::Failed) => summary.failed += 1,
                Ok(UnitOutcome::Skipped) => summary.skipped += 1,
                Err(err) => {
                    warn!(error = %err, "refresh task did not complete");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    async fn scheduled_facts(&self, topic: Topic, cancel: &CancellationToken) -> UnitOutcome {
        let Ok(_slot) = self.inner.fact_slots.clone().acquire_owned().await else {
            return UnitOutcome::Skipped;
        };
        let Some(_guard) = self.inner.locks.try_acquire(RefreshKey::facts(topic.id)) else {
            debug!(topic_id = topic.id, "topic already refreshing, skipping");
            return UnitOutcome::Skipped;
        };
        if cancel.is_cancelled() {
            return UnitOutcome::Skipped;
        }
        // The due list may be stale after waiting for a slot.
        let topic = match self.inner.collab.repo.get_topic(topic.id).await {
            Ok(Some(current)) if current.is_due(Utc::now()) => current,
            Ok(_) => return UnitOutcome::Skipped,
            Err(err) => {
                warn!(topic_id = topic.id, error = %err, "failed to re-read topic, refreshing anyway");
                topic
            }
        };
        match facts::refresh_topic(&self.inner, &topic, cancel).await {
            Ok(_) => UnitOutcome::Refreshed,
            Err(_) => UnitOutcome::Failed,
        }
    }

    async fn scheduled_news(&self, topic: NewsTopic, cancel: &CancellationToken) -> UnitOutcome {
        let Ok(_slot) = self.inner.news_slots.clone().acquire_owned().await else {
            return UnitOutcome::Skipped;
        };
        let Some(_guard) = self.inner.locks.try_acquire(RefreshKey::news(topic.id)) else {
            debug!(news_topic_id = topic.id, "news topic already refreshing, skipping");
            return UnitOutcome::Skipped;
        };
        if cancel.is_cancelled() {
            return UnitOutcome::Skipped;
        }
        let repo = &self.inner.collab.repo;
        let status = repo.get_refresh_status(topic.id).await.ok().flatten();
        let topic = match repo.get_news_topic(topic.id).await {
            Ok(Some(current)) if current.is_due(status.as_ref(), Utc::now()) => current,
            Ok(_) => return UnitOutcome::Skipped,
            Err(err) => {
                warn!(news_topic_id = topic.id, error = %err, "failed to re-read news topic, refreshing anyway");
                topic
            }
        };
        let report = news::refresh_news_topic(&self.inner, &topic, cancel).await;
        if report.error_kind.is_some() {
            UnitOutcome::Failed
        } else {
            UnitOutcome::Refreshed
        }
    }

    /// Refreshes one facts topic now. Fails fast when it is already refreshing.
    pub async fn refresh_now(&self, topic_id: i64, cancel: &CancellationToken) -> Result<FactsRefreshReport, RefreshError> {
        let _guard = self
            .inner
            .locks
            .try_acquire(RefreshKey::facts(topic_id))
            .ok_or(RefreshError::AlreadyRefreshing { what: "topic", id: topic_id })?;
        let topic = self
            .inner
            .collab
            .repo
            .get_topic(topic_id)
            .await
            .context("load topic")?
            .ok_or(RefreshError::TopicNotFound(topic_id))?;
        facts::refresh_topic(&self.inner, &topic, cancel).await
    }

    /// Refreshes one news topic now. Best effort: a busy or missing topic is
    /// logged and yields `None`; failures are reported through the status row.
    pub async fn refresh_news_now(&self, news_topic_id: i64, cancel: &CancellationToken) -> Option<NewsRefreshReport> {
        let Some(_guard) = self.inner.locks.try_acquire(RefreshKey::news(news_topic_id)) else {
            warn!(news_topic_id, "news topic is already being refreshed, ignoring request");
            return None;
        };
        let topic = match self.inner.collab.repo.get_news_topic(news_topic_id).await {
            Ok(Some(topic)) => topic,
            Ok(None) => {
                warn!(news_topic_id, "news topic not found");
                return None;
            }
            Err(err) => {
                warn!(news_topic_id, error = %err, "failed to load news topic");
                return None;
            }
        };
        Some(news::refresh_news_topic(&self.inner, &topic, cancel).await)
    }

    /// Replaces the topic's discovered sources with freshly validated ones.
    pub async fn discover_sources_now(
        &self,
        news_topic_id: i64,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryReport, RefreshError> {
        let _guard = self
            .inner
            .locks
            .try_acquire(RefreshKey::news(news_topic_id))
            .ok_or(RefreshError::AlreadyRefreshing {
                what: "news topic",
                id: news_topic_id,
            })?;
        let repo = &self.inner.collab.repo;
        let topic = repo
            .get_news_topic(news_topic_id)
            .await
            .context("load news topic")?
            .ok_or(RefreshError::NewsTopicNotFound(news_topic_id))?;
        let snapshot = SettingsSnapshot::from(repo.settings_snapshot().await.context("load settings")?);
        let provider = self.inner.collab.providers.select(topic.ai_provider.as_deref(), &snapshot);
        let report = SourceDiscovery::new(&self.inner.collab, &self.inner.config)
            .discover(&topic, &snapshot, provider, DiscoveryMode::Bootstrap, cancel)
            .await
            .context("discover sources")?;
        Ok(report)
    }
}

fn log_tick(done: std::result::Result<TickSummary, tokio::task::JoinError>) {
    match done {
        Ok(summary) if summary.facts_due + summary.news_due > 0 => info!(
            refreshed = summary.refreshed,
            failed = summary.failed,
            skipped = summary.skipped,
            purged_sessions = summary.sessions_purged,
            "tick finished"
        ),
        Ok(summary) => debug!(purged_sessions = summary.sessions_purged, "tick finished, nothing due"),
        Err(err) => warn!(error = %err, "tick task did not complete"),
    }
}

/// Runs `fut` under a time limit, aborting early when `cancel` fires.
pub(crate) async fn bounded<T>(
    cancel: &CancellationToken,
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(anyhow!("refresh cancelled")),
        outcome = tokio::time::timeout(limit, fut) => match outcome {
            Ok(result) => result,
            Err(_) => Err(anyhow!("deadline exceeded after {}s", limit.as_secs())),
        },
    }
}

/// Runs `fut` until it finishes or `cancel` fires, whichever comes first.
pub(crate) async fn until_cancelled<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        value = fut => Some(value),
    }
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub(crate) async fn record_refresh(repo: &dyn Repository, entry: RefreshLogEntry) {
    if let Err(err) = repo.log_refresh(entry).await {
        warn!(error = %err, "failed to write refresh log");
    }
}

pub(crate) async fn record_api_usage(repo: &dyn Repository, entry: ApiUsageEntry) {
    if let Err(err) = repo.log_api_usage(entry).await {
        warn!(error = %err, "failed to write api usage");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_rendered() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&boxed), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(&boxed), "owned boom");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&boxed), "unknown panic");
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_work_times_out() {
        let cancel = CancellationToken::new();
        let err = bounded(&cancel, Duration::from_secs(2), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<(), anyhow::Error>(())
        })
        .await
        .expect_err("should time out");
        assert_eq!(err.to_string(), "deadline exceeded after 2s");
        assert_eq!(classify(&err.to_string()), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn bounded_work_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = bounded(&cancel, Duration::from_secs(60), std::future::pending::<Result<()>>())
            .await
            .expect_err("should be cancelled");
        assert_eq!(err.to_string(), "refresh cancelled");
    }

    #[tokio::test]
    async fn cancellation_abandons_pending_work() {
        let cancel = CancellationToken::new();
        assert_eq!(until_cancelled(&cancel, async { 7 }).await, Some(7));
        cancel.cancel();
        assert_eq!(until_cancelled(&cancel, std::future::pending::<u8>()).await, None);
    }

    #[test]
    fn busy_errors_carry_the_item_label() {
        let err = RefreshError::AlreadyRefreshing { what: "topic", id: 3 };
        assert_eq!(err.to_string(), "topic is already being refreshed");
        assert_eq!(err.kind(), None);
    }
}
