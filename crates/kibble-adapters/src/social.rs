//! Reddit JSON listings: text posts for scraping, link posts for domain mining.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use kibble_storage::{FetchError, FetchOptions, HttpFetcher, MinIntervalSpacer};

use crate::ExtractError;

pub const REDDIT_MIN_INTERVAL: Duration = Duration::from_millis(1100);
pub const MIN_POST_WORDS: usize = 100;
pub const MIN_LINK_SCORE: i64 = 10;

const MEDIA_DOMAINS: &[&str] = &[
    "i.redd.it",
    "v.redd.it",
    "imgur.com",
    "i.imgur.com",
    "youtube.com",
    "youtu.be",
    "gfycat.com",
    "streamable.com",
    "twitter.com",
    "x.com",
    "reddit.com",
];

static SUBREDDIT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_]+$").expect("valid regex"));
static SUBREDDIT_SHORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^r/([a-zA-Z0-9_]+)").expect("valid regex"));

/// Subreddit name for `reddit.com/r/<name>` URLs (any subdomain of
/// reddit.com) or bare `r/<name>` strings.
pub fn subreddit_from_url(url: &str) -> Option<String> {
    let url = url.trim();
    if let Some(short) = SUBREDDIT_SHORT_RE.captures(url).and_then(|c| c.get(1)) {
        return Some(short.as_str().to_string());
    }
    let parsed = if url.contains("://") {
        url::Url::parse(url)
    } else {
        url::Url::parse(&format!("https://{url}"))
    }
    .ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    if host != "reddit.com" && !host.ends_with(".reddit.com") {
        return None;
    }
    let mut segments = parsed.path_segments()?;
    if segments.next() != Some("r") {
        return None;
    }
    segments
        .next()
        .filter(|name| SUBREDDIT_NAME_RE.is_match(name))
        .map(str::to_string)
}

/// True for image/video hosts and the aggregator itself, including subdomains.
pub fn is_media_domain(domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    MEDIA_DOMAINS
        .iter()
        .any(|m| domain == *m || domain.ends_with(&format!(".{m}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocialPost {
    pub title: String,
    pub body: String,
    pub permalink: String,
    pub author: String,
    pub score: i64,
}

impl SocialPost {
    pub fn to_block(&self) -> String {
        format!(
            "REDDIT POST: {}\nLINK: https://reddit.com{}\nSCORE: {} | AUTHOR: u/{}\n{}\n\n---\n\n",
            self.title, self.permalink, self.score, self.author, self.body
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPost {
    pub url: String,
    pub domain: String,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRank {
    pub domain: String,
    pub count: usize,
    pub total_score: i64,
    pub sample_urls: Vec<String>,
}

/// Read-only access to a discussion community.
#[async_trait]
pub trait SocialThreadClient: Send + Sync {
    /// Recent self-contained text posts above the minimum word count.
    async fn fetch_posts(&self, community: &str) -> Result<Vec<SocialPost>, ExtractError>;
    /// Top external link posts of the past week.
    async fn fetch_top_links(&self, community: &str, limit: usize) -> Result<Vec<LinkPost>, ExtractError>;
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<ListingChild>,
}

#[derive(Debug, Deserialize)]
struct ListingChild {
    data: RawPost,
}

#[derive(Debug, Deserialize)]
struct RawPost {
    #[serde(default)]
    title: String,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    is_self: bool,
    #[serde(default)]
    permalink: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    url: String,
    #[serde(default)]
    domain: String,
}

fn parse_listing(body: &[u8]) -> Result<Vec<RawPost>, ExtractError> {
    let listing: Listing =
        serde_json::from_slice(body).map_err(|e| ExtractError::SocialPayload(e.to_string()))?;
    Ok(listing.data.children.into_iter().map(|c| c.data).collect())
}

pub fn parse_text_posts(body: &[u8], min_words: usize) -> Result<Vec<SocialPost>, ExtractError> {
    Ok(parse_listing(body)?
        .into_iter()
        .filter(|p| p.is_self && p.selftext.split_whitespace().count() >= min_words)
        .map(|p| SocialPost {
            title: p.title,
            body: p.selftext,
            permalink: p.permalink,
            author: p.author,
            score: p.score,
        })
        .collect())
}

pub fn parse_link_posts(body: &[u8]) -> Result<Vec<LinkPost>, ExtractError> {
    Ok(parse_listing(body)?
        .into_iter()
        .filter(|p| !p.is_self && p.score >= MIN_LINK_SCORE && !p.url.is_empty())
        .filter(|p| !is_media_domain(&p.domain))
        .map(|p| LinkPost {
            url: p.url,
            domain: p.domain,
            score: p.score,
        })
        .collect())
}

/// Aggregates link posts by domain, ranked by post count then total score.
pub fn rank_domains(links: &[LinkPost], limit: usize) -> Vec<DomainRank> {
    let mut by_domain: HashMap<String, DomainRank> = HashMap::new();
    for link in links {
        let domain = link.domain.to_ascii_lowercase();
        let domain = domain.strip_prefix("www.").unwrap_or(&domain).to_string();
        if domain.is_empty() || is_media_domain(&domain) {
            continue;
        }
        let entry = by_domain.entry(domain.clone()).or_insert_with(|| DomainRank {
            domain,
            count: 0,
            total_score: 0,
            sample_urls: Vec::new(),
        });
        entry.count += 1;
        entry.total_score += link.score;
        if entry.sample_urls.len() < 3 {
            entry.sample_urls.push(link.url.clone());
        }
    }

    let mut ranked: Vec<DomainRank> = by_domain.into_values().collect();
    ranked.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(b.total_score.cmp(&a.total_score))
            .then(a.domain.cmp(&b.domain))
    });
    ranked.truncate(limit);
    ranked
}

/// Reddit client sharing one request spacer across every call.
pub struct RedditClient {
    http: Arc<HttpFetcher>,
    spacer: MinIntervalSpacer,
    base_url: String,
    min_words: usize,
}

impl RedditClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            spacer: MinIntervalSpacer::new(REDDIT_MIN_INTERVAL),
            base_url: "https://www.reddit.com".to_string(),
            min_words: MIN_POST_WORDS,
        }
    }

    async fn get(&self, subreddit: &str, url: &str) -> Result<Vec<u8>, ExtractError> {
        self.spacer.wait().await;
        debug!(subreddit, url, "reddit request");
        match self.http.fetch(url, &FetchOptions::default()).await {
            Ok(response) => Ok(response.body),
            Err(FetchError::HttpStatus { status: 404, .. }) => {
                Err(ExtractError::SubredditNotFound(subreddit.to_string()))
            }
            Err(FetchError::HttpStatus { status: 403, .. }) => {
                Err(ExtractError::SubredditForbidden(subreddit.to_string()))
            }
            Err(FetchError::HttpStatus { status: 429, .. }) => Err(ExtractError::RateLimited),
            Err(source) => Err(ExtractError::Fetch {
                url: url.to_string(),
                source,
            }),
        }
    }
}

#[async_trait]
impl SocialThreadClient for RedditClient {
    async fn fetch_posts(&self, community: &str) -> Result<Vec<SocialPost>, ExtractError> {
        let url = format!("{}/r/{community}.json?limit=25", self.base_url);
        let body = self.get(community, &url).await?;
        parse_text_posts(&body, self.min_words)
    }

    async fn fetch_top_links(&self, community: &str, limit: usize) -> Result<Vec<LinkPost>, ExtractError> {
        let url = format!("{}/r/{community}/top.json?t=week&limit={limit}", self.base_url);
        let body = self.get(community, &url).await?;
        parse_link_posts(&body)
    }
}
