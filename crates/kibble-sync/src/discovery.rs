//! Source discovery: catalog matches, mined community domains and provider
//! suggestions, validated one by one before they are persisted.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use kibble_adapters::{find_relevant, rank_domains, subreddit_from_url, validate_url, CatalogFeed, DomainRank};
use kibble_ai::{ChatProvider, DiscoveryRequest};
use kibble_core::{settings, NewNewsSource, NewsSource, NewsTopic, SettingsSnapshot};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SchedulerConfig;
use crate::{bounded, until_cancelled, Collaborators};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Replaces every discovered source of the topic. Manual sources stay.
    Bootstrap,
    /// Adds at most `limit` sources next to the existing ones.
    Replace { limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub news_topic_id: i64,
    pub mode: DiscoveryMode,
    pub suggested: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub skipped_existing: usize,
    pub cleared: u64,
}

pub struct SourceDiscovery<'a> {
    collab: &'a Collaborators,
    config: &'a SchedulerConfig,
}

impl<'a> SourceDiscovery<'a> {
    pub fn new(collab: &'a Collaborators, config: &'a SchedulerConfig) -> Self {
        Self { collab, config }
    }

    pub async fn discover(
        &self,
        topic: &NewsTopic,
        snapshot: &SettingsSnapshot,
        provider: Arc<dyn ChatProvider>,
        mode: DiscoveryMode,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryReport> {
        let span = info_span!("discover_sources", news_topic_id = topic.id, topic = %topic.name, ?mode);
        self.discover_inner(topic, snapshot, provider, mode, cancel)
            .instrument(span)
            .await
    }

    async fn discover_inner(
        &self,
        topic: &NewsTopic,
        snapshot: &SettingsSnapshot,
        provider: Arc<dyn ChatProvider>,
        mode: DiscoveryMode,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryReport> {
        let repo = &self.collab.repo;
        let catalog = find_relevant(&topic.name, &topic.description);
        let existing = repo
            .sources_for_news_topic(topic.id)
            .await
            .context("list existing sources")?;
        let community_domains = self.mine_community_domains(&existing, &catalog, cancel).await;
        let research = if topic.is_niche {
            let research = self
                .collab
                .ai
                .research_topic(provider.as_ref(), &topic.name, &topic.description);
            until_cancelled(cancel, research).await.flatten()
        } else {
            None
        };
        info!(
            catalog = catalog.len(),
            community_domains = community_domains.len(),
            researched = research.is_some(),
            "gathered discovery signals"
        );

        let request = DiscoveryRequest {
            topic_name: &topic.name,
            description: &topic.description,
            sourcing_instructions: snapshot.get(settings::NEWS_SOURCING_INSTRUCTIONS),
            catalog: &catalog,
            community_domains: &community_domains,
            research: research.as_deref(),
        };
        let generated = bounded(cancel, self.config.discovery_timeout, async {
            self.collab
                .ai
                .discover_sources(provider.as_ref(), &request)
                .await
                .map_err(anyhow::Error::from)
        })
        .await?;

        let mut report = DiscoveryReport {
            news_topic_id: topic.id,
            mode,
            suggested: generated.value.len(),
            accepted: 0,
            rejected: 0,
            skipped_existing: 0,
            cleared: 0,
        };

        let mut known: HashSet<String> = match mode {
            DiscoveryMode::Bootstrap => {
                report.cleared = repo
                    .clear_discovered_sources(topic.id)
                    .await
                    .context("clear discovered sources")?;
                existing
                    .iter()
                    .filter(|s| s.is_manual)
                    .map(|s| s.url.clone())
                    .collect()
            }
            DiscoveryMode::Replace { .. } => existing.iter().map(|s| s.url.clone()).collect(),
        };

        for candidate in generated.value {
            if let DiscoveryMode::Replace { limit } = mode {
                if report.accepted >= limit {
                    break;
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            let url = candidate.url.trim().to_string();
            if known.contains(&url) {
                report.skipped_existing += 1;
                continue;
            }
            if let Err(err) = validate_url(&url) {
                debug!(url = %url, error = %err, "discarding malformed candidate");
                report.rejected += 1;
                continue;
            }

            let Some(outcome) = until_cancelled(cancel, self.collab.validator.validate(&url, &candidate.name)).await
            else {
                info!(url = %url, "discovery cancelled during validation");
                break;
            };
            if !outcome.ok {
                info!(url = %url, reason = %outcome.reason, "candidate source rejected");
                report.rejected += 1;
                continue;
            }
            let effective = outcome.effective_url().to_string();
            if !known.insert(effective.clone()) {
                report.skipped_existing += 1;
                continue;
            }
            known.insert(url);

            let name = if outcome.name.trim().is_empty() {
                candidate.name.trim().to_string()
            } else {
                outcome.name.trim().to_string()
            };
            let new_source = NewNewsSource {
                news_topic_id: topic.id,
                url: effective.clone(),
                name,
                is_manual: false,
            };
            match repo.add_news_source(new_source).await {
                Ok(id) => {
                    info!(source_id = id, url = %effective, "added discovered source");
                    report.accepted += 1;
                }
                Err(err) => warn!(url = %effective, error = %err, "failed to store discovered source"),
            }
        }

        info!(
            suggested = report.suggested,
            accepted = report.accepted,
            rejected = report.rejected,
            skipped = report.skipped_existing,
            "source discovery finished"
        );
        Ok(report)
    }

    /// Domains most linked from the communities among the topic's sources and
    /// catalog matches. Community failures only shrink the result.
    pub async fn mine_community_domains(
        &self,
        existing: &[NewsSource],
        catalog: &[CatalogFeed],
        cancel: &CancellationToken,
    ) -> Vec<DomainRank> {
        let mut seen = HashSet::new();
        let communities: Vec<String> = existing
            .iter()
            .map(|s| s.url.as_str())
            .chain(catalog.iter().map(|f| f.url.as_str()))
            .filter_map(subreddit_from_url)
            .filter(|name| seen.insert(name.to_ascii_lowercase()))
            .take(self.config.mined_communities)
            .collect();
        if communities.is_empty() {
            return Vec::new();
        }

        let mut links = Vec::new();
        for community in &communities {
            let fetch = self
                .collab
                .social
                .fetch_top_links(community, self.config.posts_per_community);
            match until_cancelled(cancel, fetch).await {
                Some(Ok(mut posts)) => links.append(&mut posts),
                Some(Err(err)) => debug!(community, error = %err, "community link mining failed"),
                None => break,
            }
        }
        let ranked = rank_domains(&links, self.config.max_community_domains);
        debug!(communities = communities.len(), links = links.len(), domains = ranked.len(), "mined community domains");
        ranked
    }
}
