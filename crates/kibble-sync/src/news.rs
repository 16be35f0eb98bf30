//! News refresh: scrape active sources, decay or remove failing ones, keep
//! the pool populated through discovery and summarize the content into stories.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::FutureExt;
use kibble_adapters::ExtractError;
use kibble_ai::SummarizeRequest;
use kibble_core::{
    settings, NewStory, NewsRefreshStatus, NewsSource, NewsTopic, RefreshKind, RefreshLogEntry, RefreshStatus,
    ScrapedContent, SettingsSnapshot,
};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::classify::{classify, ErrorKind};
use crate::discovery::{DiscoveryMode, DiscoveryReport, SourceDiscovery};
use crate::{bounded, panic_message, record_refresh, SchedulerInner};

/// Stored scrape errors are cut to this many characters.
const MAX_SOURCE_ERROR_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewsRefreshReport {
    pub news_topic_id: i64,
    pub status: RefreshStatus,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub sources_attempted: usize,
    pub sources_scraped: usize,
    pub removed_source_count: usize,
    pub discovery: Option<DiscoveryReport>,
    pub stories_created: usize,
    pub provider: String,
    pub model: String,
}

impl NewsRefreshReport {
    fn new(news_topic_id: i64) -> Self {
        Self {
            news_topic_id,
            status: RefreshStatus::InProgress,
            error_kind: None,
            error_message: None,
            sources_attempted: 0,
            sources_scraped: 0,
            removed_source_count: 0,
            discovery: None,
            stories_created: 0,
            provider: String::new(),
            model: String::new(),
        }
    }
}

type ScrapeResult = (NewsSource, Result<ScrapedContent, String>);

pub(crate) async fn refresh_news_topic(
    inner: &SchedulerInner,
    topic: &NewsTopic,
    cancel: &CancellationToken,
) -> NewsRefreshReport {
    let span = info_span!("refresh_news", news_topic_id = topic.id, topic = %topic.name);
    run_cycle(inner, topic, cancel).instrument(span).await
}

async fn run_cycle(inner: &SchedulerInner, topic: &NewsTopic, cancel: &CancellationToken) -> NewsRefreshReport {
    let repo = inner.collab.repo.as_ref();
    let started = Instant::now();
    let previous_refresh = match repo.get_refresh_status(topic.id).await {
        Ok(status) => status.and_then(|s| s.last_refresh),
        Err(err) => {
            warn!(error = %err, "failed to read refresh status");
            None
        }
    };

    let mut status = NewsRefreshStatus::in_progress(topic.id);
    status.last_refresh = previous_refresh;
    write_status(inner, status.clone()).await;

    let mut report = NewsRefreshReport::new(topic.id);
    let outcome = AssertUnwindSafe(refresh_steps(inner, topic, cancel, &mut report))
        .catch_unwind()
        .await;

    let now = Utc::now();
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => {
            let message = format!("{err:#}");
            Some((classify(&message), message))
        }
        Err(panic) => {
            let message = format!("panic: {}", panic_message(&panic));
            error!(panic = %message, "news refresh panicked");
            Some((ErrorKind::Panic, message))
        }
    };

    match failure {
        None => {
            report.status = RefreshStatus::Completed;
            status.status = RefreshStatus::Completed;
            status.last_refresh = Some(now);
            status.next_refresh = Some(now + minutes(topic.refresh_interval_minutes));
            write_status(inner, status).await;
            if let Err(err) = repo.touch_news_topic_refreshed(topic.id, now).await {
                warn!(error = %err, "failed to stamp news topic refresh time");
            }
            info!(
                stories = report.stories_created,
                scraped = report.sources_scraped,
                removed = report.removed_source_count,
                "news refresh complete"
            );
        }
        Some((kind, message)) => {
            warn!(error_kind = %kind, error = %message, "news refresh failed");
            report.status = RefreshStatus::Failed;
            report.error_kind = Some(kind);
            report.error_message = Some(message.clone());
            status.status = RefreshStatus::Failed;
            status.next_refresh = Some(backoff_until(now, inner.config.failure_backoff));
            status.error_message = message;
            status.error_kind = Some(kind.as_str().to_string());
            write_status(inner, status).await;
        }
    }

    record_refresh(
        repo,
        RefreshLogEntry {
            kind: RefreshKind::News,
            topic_id: topic.id,
            topic_name: topic.name.clone(),
            success: report.status == RefreshStatus::Completed,
            error_kind: report.error_kind.map(|k| k.as_str().to_string()),
            error_message: report.error_message.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            ai_provider: report.provider.clone(),
            ai_model: report.model.clone(),
            item_count: report.stories_created,
        },
    )
    .await;
    report
}

async fn refresh_steps(
    inner: &SchedulerInner,
    topic: &NewsTopic,
    cancel: &CancellationToken,
    report: &mut NewsRefreshReport,
) -> anyhow::Result<()> {
    let repo = inner.collab.repo.as_ref();
    let config = &inner.config;
    let snapshot = SettingsSnapshot::from(repo.settings_snapshot().await.context("load settings")?);
    let provider = inner.collab.providers.select(topic.ai_provider.as_deref(), &snapshot);
    report.provider = provider.name().to_string();
    let discovery = SourceDiscovery::new(&inner.collab, config);

    let mut sources = repo
        .active_sources_for_news_topic(topic.id)
        .await
        .context("get sources")?;
    if sources.is_empty() {
        info!("no active sources, running discovery");
        let found = discovery
            .discover(topic, &snapshot, provider.clone(), DiscoveryMode::Bootstrap, cancel)
            .await
            .context("discover sources")?;
        report.discovery = Some(found);
        sources = repo
            .active_sources_for_news_topic(topic.id)
            .await
            .context("get sources")?;
        if sources.is_empty() {
            bail!("no sources available for topic");
        }
    }
    report.sources_attempted = sources.len();

    let results = scrape_all(inner, sources, cancel).await;
    if cancel.is_cancelled() {
        bail!("refresh cancelled before scrape results were recorded");
    }
    let mut contents = Vec::with_capacity(results.len());
    for (source, result) in results {
        match result {
            Ok(content) => {
                if source.failure_count > 0 {
                    if let Err(err) = repo.record_source_success(source.id).await {
                        warn!(source_id = source.id, error = %err, "failed to record source success");
                    }
                }
                contents.push(content);
            }
            Err(message) => {
                let message = truncate_chars(&message, MAX_SOURCE_ERROR_CHARS);
                match repo.record_source_failure(source.id, &message).await {
                    Ok(count) if count >= config.removal_threshold => {
                        match repo.delete_news_source(source.id).await {
                            Ok(()) => {
                                info!(source_id = source.id, url = %source.url, failures = count, "removed failing source");
                                report.removed_source_count += 1;
                            }
                            Err(err) => warn!(source_id = source.id, error = %err, "failed to remove source"),
                        }
                    }
                    Ok(count) => {
                        debug!(source_id = source.id, failures = count, error = %message, "source scrape failed")
                    }
                    Err(err) => warn!(source_id = source.id, error = %err, "failed to record source failure"),
                }
            }
        }
    }
    report.sources_scraped = contents.len();

    // One discovery pass per cycle: skipped when bootstrap already ran.
    if report.removed_source_count > 0 && report.discovery.is_none() {
        let remaining = repo
            .active_sources_for_news_topic(topic.id)
            .await
            .context("get sources")?;
        let mode = if remaining.is_empty() {
            DiscoveryMode::Bootstrap
        } else {
            DiscoveryMode::Replace {
                limit: report.removed_source_count,
            }
        };
        match discovery.discover(topic, &snapshot, provider.clone(), mode, cancel).await {
            Ok(found) => report.discovery = Some(found),
            Err(err) => warn!(error = %format!("{err:#}"), "replacement discovery failed"),
        }
    }

    if contents.is_empty() {
        bail!("failed to scrape any content from active sources");
    }

    let recent_titles = repo
        .recent_story_titles(topic.id, config.recent_titles)
        .await
        .unwrap_or_else(|err| {
            warn!(error = %err, "failed to load recent story titles");
            Vec::new()
        });
    let request = SummarizeRequest {
        topic_name: &topic.name,
        count: topic.stories_per_refresh,
        summarizing_instructions: snapshot.get(settings::NEWS_SUMMARIZING_INSTRUCTIONS),
        tone_instructions: snapshot.get(settings::NEWS_TONE_INSTRUCTIONS),
        min_words: topic.summary_min_words,
        max_words: topic.summary_max_words,
        contents: &contents,
        recent_titles: &recent_titles,
    };
    let generated = bounded(cancel, config.summarize_timeout, async {
        inner
            .collab
            .ai
            .summarize(provider.as_ref(), &request)
            .await
            .map_err(anyhow::Error::from)
    })
    .await
    .context("summarize content")?;
    report.provider = generated.provider.clone();
    report.model = generated.model.clone();

    for story in generated.value {
        let new_story = NewStory {
            news_topic_id: topic.id,
            title: story.title,
            summary: story.summary,
            source_url: story.source_url,
            source_title: story.source_title,
            ai_provider: generated.provider.clone(),
            ai_model: generated.model.clone(),
        };
        match repo.create_story(new_story).await {
            Ok(_) => report.stories_created += 1,
            Err(err) => warn!(error = %err, "failed to store story"),
        }
    }

    let keep = topic.stories_per_refresh as usize * config.story_retention_factor;
    match repo.prune_stories(topic.id, keep).await {
        Ok(pruned) if pruned > 0 => debug!(pruned, keep, "pruned old stories"),
        Ok(_) => {}
        Err(err) => warn!(error = %err, "failed to prune old stories"),
    }
    Ok(())
}

/// Scrapes every source under the shared concurrency limit and one wall-clock
/// deadline. Sources still running at the deadline report a timeout.
async fn scrape_all(inner: &SchedulerInner, sources: Vec<NewsSource>, cancel: &CancellationToken) -> Vec<ScrapeResult> {
    let deadline = tokio::time::Instant::now() + inner.config.scrape_timeout;
    let slots = Arc::new(Semaphore::new(inner.config.scrape_concurrency.max(1)));
    let total = sources.len();
    let mut tasks = JoinSet::new();

    for source in sources {
        let scraper = inner.collab.scraper.clone();
        let slots = slots.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let url = source.url.clone();
            let name = source.name.clone();
            let timed_out = ExtractError::Timeout(url.clone()).to_string();
            let cancelled = format!("refresh cancelled while scraping {url}");
            let work = async {
                let _permit = slots
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|err| format!("scrape slot unavailable: {err}"))?;
                scraper.scrape(&url, &name).await.map_err(|err| err.to_string())
            };
            let guarded = AssertUnwindSafe(work).catch_unwind();
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(cancelled),
                outcome = tokio::time::timeout_at(deadline, guarded) => match outcome {
                    Ok(Ok(result)) => result,
                    Ok(Err(panic)) => Err(format!("panic: {}", panic_message(&panic))),
                    Err(_) => Err(timed_out),
                },
            };
            (source, result)
        });
    }

    let mut results = Vec::with_capacity(total);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(err) => warn!(error = %err, "scrape task did not complete"),
        }
    }
    results.sort_by_key(|(source, _)| source.id);
    results
}

async fn write_status(inner: &SchedulerInner, status: NewsRefreshStatus) {
    if let Err(err) = inner.collab.repo.upsert_refresh_status(status).await {
        warn!(error = %err, "failed to write refresh status");
    }
}

fn minutes(value: u32) -> ChronoDuration {
    ChronoDuration::minutes(i64::from(value))
}

fn backoff_until(now: DateTime<Utc>, backoff: std::time::Duration) -> DateTime<Utc> {
    now + ChronoDuration::from_std(backoff).unwrap_or_else(|_| ChronoDuration::minutes(5))
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
