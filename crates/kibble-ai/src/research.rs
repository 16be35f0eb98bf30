//! Encyclopedia lookups used to ground prompts for niche topics.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use kibble_storage::{FetchOptions, HttpFetcher};
use serde::Deserialize;
use tracing::debug;

pub const HITS_PER_QUERY: usize = 3;
pub const MAX_ARTICLES: usize = 5;
/// Gathering stops once the material grows past this many bytes.
pub const MATERIAL_SOFT_CAP: usize = 4000;

const WIKIPEDIA_API: &str = "https://en.wikipedia.org/w/api.php";
const WIKIPEDIA_SUMMARY: &str = "https://en.wikipedia.org/api/rest_v1/page/summary";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait ResearchSource: Send + Sync {
    /// Article titles matching `query`, best first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>>;
    /// A `## Title\nextract` block for one article.
    async fn summary(&self, title: &str) -> Result<String>;
}

/// Searches every query, keeps the first unique titles and concatenates
/// their summaries. Individual lookup failures are skipped.
pub async fn gather(source: &dyn ResearchSource, topic_name: &str, queries: &[String]) -> Result<String> {
    let mut seen = HashSet::new();
    let mut titles = Vec::new();
    for query in queries {
        match source.search(query, HITS_PER_QUERY).await {
            Ok(hits) => {
                for title in hits {
                    if seen.insert(title.clone()) {
                        titles.push(title);
                    }
                }
            }
            Err(err) => debug!(query, error = %err, "research search failed"),
        }
    }
    if titles.is_empty() {
        bail!("no Wikipedia articles found for {topic_name:?}");
    }
    titles.truncate(MAX_ARTICLES);

    let mut material = String::new();
    for title in &titles {
        match source.summary(title).await {
            Ok(summary) => {
                material.push_str(&summary);
                material.push_str("\n\n");
                if material.len() > MATERIAL_SOFT_CAP {
                    break;
                }
            }
            Err(err) => debug!(title, error = %err, "research summary failed"),
        }
    }
    let material = material.trim();
    if material.is_empty() {
        bail!("no Wikipedia summaries retrieved for {topic_name:?}");
    }
    Ok(material.to_string())
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    query: SearchQuery,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    search: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    title: String,
}

#[derive(Debug, Deserialize)]
struct PageSummary {
    #[serde(default)]
    title: String,
    #[serde(default)]
    extract: String,
}

pub struct WikipediaClient {
    http: Arc<HttpFetcher>,
}

impl WikipediaClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }

    fn options() -> FetchOptions {
        FetchOptions {
            accept: Some("application/json"),
            timeout: Some(LOOKUP_TIMEOUT),
            ..FetchOptions::default()
        }
    }
}

pub fn search_url(query: &str, limit: usize) -> Result<url::Url> {
    let limit = limit.to_string();
    url::Url::parse_with_params(
        WIKIPEDIA_API,
        [
            ("action", "query"),
            ("list", "search"),
            ("srsearch", query),
            ("format", "json"),
            ("utf8", "1"),
            ("srlimit", limit.as_str()),
        ],
    )
    .context("building wikipedia search url")
}

pub fn summary_url(title: &str) -> Result<url::Url> {
    let mut url = url::Url::parse(WIKIPEDIA_SUMMARY).context("parsing wikipedia summary url")?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("wikipedia summary url cannot take path segments"))?
        .push(&title.replace(' ', "_"));
    Ok(url)
}

#[async_trait]
impl ResearchSource for WikipediaClient {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let url = search_url(query, limit)?;
        let response = self
            .http
            .fetch(url.as_str(), &Self::options())
            .await
            .with_context(|| format!("wikipedia search for {query:?}"))?;
        let parsed: SearchResponse =
            serde_json::from_slice(&response.body).context("decoding wikipedia search response")?;
        Ok(parsed.query.search.into_iter().map(|hit| hit.title).collect())
    }

    async fn summary(&self, title: &str) -> Result<String> {
        let url = summary_url(title)?;
        let response = self
            .http
            .fetch(url.as_str(), &Self::options())
            .await
            .with_context(|| format!("wikipedia summary for {title:?}"))?;
        let page: PageSummary =
            serde_json::from_slice(&response.body).context("decoding wikipedia summary response")?;
        if page.extract.trim().is_empty() {
            bail!("no summary available for {title:?}");
        }
        Ok(format!("## {}\n{}", page.title, page.extract))
    }
}
