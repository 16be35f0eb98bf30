//! Facts refresh: generate a batch, drop near-duplicates, persist the rest.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use futures::FutureExt;
use kibble_ai::{ChatProvider, FactsRequest};
use kibble_core::{settings, ApiUsageEntry, NewFact, RefreshKind, RefreshLogEntry, SettingsSnapshot, Topic};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::classify::{classify, ErrorKind};
use crate::similarity::{grams_from_json, grams_to_json};
use crate::{bounded, panic_message, record_api_usage, record_refresh, until_cancelled, RefreshError, SchedulerInner};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactsRefreshReport {
    pub topic_id: i64,
    pub requested: u32,
    pub generated: usize,
    pub discarded: usize,
    pub tokens_used: u64,
    pub provider: String,
    pub model: String,
}

/// Attribution known so far, used to label failure rows.
#[derive(Default)]
struct Attempt {
    provider: String,
    model: String,
    tokens_used: u64,
}

pub(crate) async fn refresh_topic(
    inner: &SchedulerInner,
    topic: &Topic,
    cancel: &CancellationToken,
) -> Result<FactsRefreshReport, RefreshError> {
    let span = info_span!("refresh_facts", topic_id = topic.id, topic = %topic.name);
    async {
        let started = Instant::now();
        let mut attempt = Attempt::default();
        let outcome = AssertUnwindSafe(generate_and_store(inner, topic, cancel, &mut attempt))
            .catch_unwind()
            .await;

        let (kind, message) = match outcome {
            Ok(Ok(report)) => return Ok(report),
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                (classify(&message), message)
            }
            Err(panic) => {
                let message = format!("panic: {}", panic_message(&panic));
                error!(panic = %message, "facts refresh panicked");
                (ErrorKind::Panic, message)
            }
        };

        warn!(error_kind = %kind, error = %message, "facts refresh failed");
        record_api_usage(
            inner.collab.repo.as_ref(),
            ApiUsageEntry {
                topic_id: Some(topic.id),
                facts_requested: topic.facts_per_refresh,
                facts_generated: 0,
                facts_discarded: 0,
                tokens_used: attempt.tokens_used,
                ai_provider: attempt.provider.clone(),
                ai_model: attempt.model.clone(),
                error_message: Some(message.clone()),
            },
        )
        .await;
        record_refresh(
            inner.collab.repo.as_ref(),
            RefreshLogEntry {
                kind: RefreshKind::Facts,
                topic_id: topic.id,
                topic_name: topic.name.clone(),
                success: false,
                error_kind: Some(kind.as_str().to_string()),
                error_message: Some(message.clone()),
                duration_ms: started.elapsed().as_millis() as u64,
                ai_provider: attempt.provider,
                ai_model: attempt.model,
                item_count: 0,
            },
        )
        .await;
        Err(RefreshError::Failed { kind, message })
    }
    .instrument(span)
    .await
}

async fn generate_and_store(
    inner: &SchedulerInner,
    topic: &Topic,
    cancel: &CancellationToken,
    attempt: &mut Attempt,
) -> anyhow::Result<FactsRefreshReport> {
    let started = Instant::now();
    let repo = inner.collab.repo.as_ref();
    let snapshot = SettingsSnapshot::from(repo.settings_snapshot().await.context("load settings")?);
    let provider = inner.collab.providers.select(topic.ai_provider.as_deref(), &snapshot);
    attempt.provider = provider.name().to_string();

    let research = until_cancelled(cancel, research_for(inner, topic, provider.as_ref()))
        .await
        .flatten();
    let request = FactsRequest {
        topic_name: &topic.name,
        description: &topic.description,
        count: topic.facts_per_refresh,
        custom_instructions: snapshot.get(settings::AI_CUSTOM_INSTRUCTIONS),
        tone_instructions: snapshot.get(settings::AI_TONE_INSTRUCTIONS),
        min_words: topic.summary_min_words,
        max_words: topic.summary_max_words,
        research: research.as_deref(),
    };
    let generated = bounded(cancel, inner.config.facts_timeout, async {
        inner
            .collab
            .ai
            .generate_facts(provider.as_ref(), &request)
            .await
            .map_err(anyhow::Error::from)
    })
    .await
    .context("generate facts")?;
    attempt.provider = generated.provider.clone();
    attempt.model = generated.model.clone();
    attempt.tokens_used = generated.tokens_used;

    let mut existing: Vec<_> = repo
        .fact_grams_for_topic(topic.id)
        .await
        .context("load existing facts")?
        .iter()
        .map(|json| grams_from_json(json))
        .collect();

    let (kept, discarded) = inner
        .similarity
        .dedupe_batch(generated.value.iter().map(String::as_str), &mut existing);
    debug!(kept = kept.len(), discarded, "deduplicated generated facts");
    let mut stored = 0usize;
    for (content, grams) in kept {
        let fact = NewFact {
            topic_id: topic.id,
            content: content.to_string(),
            grams: grams_to_json(&grams),
            is_custom: false,
            ai_provider: generated.provider.clone(),
            ai_model: generated.model.clone(),
        };
        match repo.create_fact(fact).await {
            Ok(_) => stored += 1,
            Err(err) => warn!(error = %err, "failed to store fact"),
        }
    }

    record_api_usage(
        repo,
        ApiUsageEntry {
            topic_id: Some(topic.id),
            facts_requested: topic.facts_per_refresh,
            facts_generated: stored as u32,
            facts_discarded: discarded as u32,
            tokens_used: generated.tokens_used,
            ai_provider: generated.provider.clone(),
            ai_model: generated.model.clone(),
            error_message: None,
        },
    )
    .await;
    if let Err(err) = repo.touch_topic_refreshed(topic.id, Utc::now()).await {
        warn!(error = %err, "failed to stamp topic refresh time");
    }
    record_refresh(
        repo,
        RefreshLogEntry {
            kind: RefreshKind::Facts,
            topic_id: topic.id,
            topic_name: topic.name.clone(),
            success: true,
            error_kind: None,
            error_message: None,
            duration_ms: started.elapsed().as_millis() as u64,
            ai_provider: generated.provider.clone(),
            ai_model: generated.model.clone(),
            item_count: stored,
        },
    )
    .await;

    info!(
        generated = stored,
        discarded,
        tokens = generated.tokens_used,
        provider = %generated.provider,
        model = %generated.model,
        "facts refresh complete"
    );
    Ok(FactsRefreshReport {
        topic_id: topic.id,
        requested: topic.facts_per_refresh,
        generated: stored,
        discarded,
        tokens_used: generated.tokens_used,
        provider: generated.provider,
        model: generated.model,
    })
}

async fn research_for(inner: &SchedulerInner, topic: &Topic, provider: &dyn ChatProvider) -> Option<String> {
    if !topic.is_niche {
        return None;
    }
    inner
        .collab
        .ai
        .research_topic(provider, &topic.name, &topic.description)
        .await
}
