//! Content extraction, feed discovery and source validation for news sources.

use std::sync::Arc;

use async_trait::async_trait;
use kibble_core::ScrapedContent;
use kibble_storage::{FetchError, FetchOptions, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub mod catalog;
pub mod feed;
pub mod html;
pub mod social;
pub mod validator;

pub use catalog::{find_relevant, CatalogFeed};
pub use feed::extract_feed;
pub use html::{discover_feed_link, extract_html, HtmlExtraction};
pub use social::{
    is_media_domain, rank_domains, subreddit_from_url, DomainRank, LinkPost, RedditClient,
    SocialPost, SocialThreadClient,
};
pub use validator::{validate_url, CandidateValidator, SourceValidator, ValidationOutcome};

pub const CRATE_NAME: &str = "kibble-adapters";

/// Extracted text is capped at this many characters, plus an ellipsis.
pub const MAX_CONTENT_CHARS: usize = 50_000;
/// HTML extraction below this many characters is treated as a failure.
pub const MIN_HTML_CHARS: usize = 100;
/// Feed bodies are read up to this many bytes.
pub const MAX_FEED_BYTES: usize = 1024 * 1024;

const FEED_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.9, */*;q=0.8";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to visit {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("insufficient content scraped from {url} ({chars} chars)")]
    InsufficientContent { url: String, chars: usize },
    #[error("failed to parse feed: {0}")]
    Feed(String),
    #[error("feed url returned html content-type, not a feed")]
    HtmlInsteadOfFeed,
    #[error("subreddit r/{0} not found")]
    SubredditNotFound(String),
    #[error("subreddit r/{0} is private or quarantined")]
    SubredditForbidden(String),
    #[error("Reddit rate limit exceeded")]
    RateLimited,
    #[error("no valid posts found in r/{0} (text posts with >100 words)")]
    NoPosts(String),
    #[error("failed to parse Reddit response: {0}")]
    SocialPayload(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("context deadline exceeded while scraping {0}")]
    Timeout(String),
    #[error("{0}")]
    Message(String),
}

/// Which extraction strategy a URL is routed to. First match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Social { subreddit: String },
    Feed,
    Page,
}

impl SourceKind {
    pub fn for_url(url: &str) -> Self {
        if let Some(subreddit) = subreddit_from_url(url) {
            return Self::Social { subreddit };
        }
        if is_feed_url(url) {
            return Self::Feed;
        }
        Self::Page
    }
}

/// True when the URL path looks like an RSS or Atom endpoint.
pub fn is_feed_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    let without_fragment = lower.split('#').next().unwrap_or_default();
    let without_query = without_fragment.split('?').next().unwrap_or_default();
    let path = without_query.trim_end_matches('/');

    [".xml", ".rss", ".atom", "/feed", "/rss", "/atom"]
        .iter()
        .any(|suffix| path.ends_with(suffix))
        || path.contains("/feeds/")
        || path.contains("/rss/")
}

fn is_xml_content_type(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.contains("rss+xml") || ct.contains("atom+xml") || ct.contains("/xml")
        })
        .unwrap_or(false)
}

/// Collapses all whitespace runs to single spaces.
pub fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn truncate_content(mut content: String) -> String {
    if let Some((cut, _)) = content.char_indices().nth(MAX_CONTENT_CHARS) {
        content.truncate(cut);
        content.push_str("...");
    }
    content
}

fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string))
        .unwrap_or_else(|| url.to_string())
}

fn display_name(name: &str, title: Option<&str>, url: &str) -> String {
    let name = name.trim();
    if !name.is_empty() {
        return name.to_string();
    }
    match title.map(str::trim) {
        Some(title) if !title.is_empty() => title.to_string(),
        _ => host_of(url),
    }
}

/// Anything that can turn a source URL into normalized text.
#[async_trait]
pub trait SourceScraper: Send + Sync {
    async fn scrape(&self, url: &str, name: &str) -> Result<ScrapedContent, ExtractError>;
}

/// Live extractor: social JSON API, then RSS/Atom, then HTML heuristics.
pub struct ContentExtractor {
    http: Arc<HttpFetcher>,
    social: Arc<dyn SocialThreadClient>,
}

impl ContentExtractor {
    pub fn new(http: Arc<HttpFetcher>, social: Arc<dyn SocialThreadClient>) -> Self {
        Self { http, social }
    }

    async fn extract_social(&self, url: &str, name: &str, subreddit: &str) -> Result<ScrapedContent, ExtractError> {
        let posts = self.social.fetch_posts(subreddit).await?;
        if posts.is_empty() {
            return Err(ExtractError::NoPosts(subreddit.to_string()));
        }
        let content: String = posts.iter().map(SocialPost::to_block).collect();
        let source_name = if name.trim().is_empty() {
            format!("r/{subreddit}")
        } else {
            name.trim().to_string()
        };
        Ok(ScrapedContent {
            url: url.to_string(),
            source_name,
            content: truncate_content(content),
        })
    }

    async fn extract_feed_url(&self, url: &str, name: &str) -> Result<ScrapedContent, ExtractError> {
        let options = FetchOptions {
            accept: Some(FEED_ACCEPT),
            max_bytes: Some(MAX_FEED_BYTES),
            ..FetchOptions::default()
        };
        let response = self
            .http
            .fetch(url, &options)
            .await
            .map_err(|source| ExtractError::Fetch { url: url.to_string(), source })?;

        feed_or_page(url, name, response.is_html(), &response.body)
    }

    async fn extract_page(&self, url: &str, name: &str) -> Result<ScrapedContent, ExtractError> {
        let response = self
            .http
            .fetch(url, &FetchOptions::default())
            .await
            .map_err(|source| ExtractError::Fetch { url: url.to_string(), source })?;

        if is_xml_content_type(response.content_type.as_deref()) {
            return feed_or_page(url, name, false, &response.body);
        }
        page_content(url, name, &response.text())
    }
}

/// HTML heuristics over an already fetched body.
pub fn page_content(url: &str, name: &str, body: &str) -> Result<ScrapedContent, ExtractError> {
    let page = extract_html(body)?;
    let chars = page.text.chars().count();
    if chars < MIN_HTML_CHARS {
        return Err(ExtractError::InsufficientContent { url: url.to_string(), chars });
    }
    Ok(ScrapedContent {
        url: url.to_string(),
        source_name: display_name(name, page.title.as_deref(), url),
        content: truncate_content(page.text),
    })
}

/// Parses a feed response, falling back to HTML heuristics on the same body
/// when the server sent HTML or the XML does not parse.
pub fn feed_or_page(url: &str, name: &str, is_html: bool, body: &[u8]) -> Result<ScrapedContent, ExtractError> {
    let parsed = if is_html {
        Err(ExtractError::HtmlInsteadOfFeed)
    } else {
        extract_feed(body)
    };
    match parsed {
        Ok(feed) => Ok(ScrapedContent {
            url: url.to_string(),
            source_name: display_name(name, feed.title.as_deref(), url),
            content: truncate_content(feed.text),
        }),
        Err(err) => {
            debug!(url, error = %err, "feed parsing failed, falling back to html extraction");
            page_content(url, name, &String::from_utf8_lossy(body))
        }
    }
}

#[async_trait]
impl SourceScraper for ContentExtractor {
    async fn scrape(&self, url: &str, name: &str) -> Result<ScrapedContent, ExtractError> {
        let kind = SourceKind::for_url(url);
        let span = info_span!("extract", url, kind = ?kind);
        async {
            match &kind {
                SourceKind::Social { subreddit } => self.extract_social(url, name, subreddit).await,
                SourceKind::Feed => self.extract_feed_url(url, name).await,
                SourceKind::Page => self.extract_page(url, name).await,
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_shaped_urls_are_recognized() {
        assert!(is_feed_url("https://x.com/feed"));
        assert!(is_feed_url("https://x.com/feed/"));
        assert!(is_feed_url("https://blog.rust-lang.org/feed.xml"));
        assert!(is_feed_url("https://example.org/atom?page=2"));
        assert!(is_feed_url("https://example.org/feeds/posts/default"));
        assert!(is_feed_url("https://example.org/rss/world"));
        assert!(!is_feed_url("https://example.org/feedback"));
        assert!(!is_feed_url("https://example.org/news"));
    }

    #[test]
    fn dispatch_prefers_social_then_feed_then_page() {
        assert_eq!(
            SourceKind::for_url("https://www.reddit.com/r/rust/"),
            SourceKind::Social { subreddit: "rust".into() }
        );
        assert_eq!(
            SourceKind::for_url("https://www.reddit.com/r/space/.rss"),
            SourceKind::Social { subreddit: "space".into() }
        );
        assert_eq!(SourceKind::for_url("https://x.com/feed"), SourceKind::Feed);
        assert_eq!(SourceKind::for_url("https://x.com/news"), SourceKind::Page);
        assert_eq!(SourceKind::for_url("https://notreddit.com/r/x"), SourceKind::Page);
        assert_eq!(SourceKind::for_url("https://example.org/?u=reddit.com/r/x"), SourceKind::Page);
    }

    #[test]
    fn truncation_appends_ellipsis_only_when_needed() {
        let short = "abc".to_string();
        assert_eq!(truncate_content(short.clone()), short);

        let long = "é".repeat(MAX_CONTENT_CHARS + 10);
        let cut = truncate_content(long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), MAX_CONTENT_CHARS + 3);
    }

    #[test]
    fn display_name_falls_back_to_title_then_host() {
        assert_eq!(display_name("Mine", Some("Title"), "https://a.org/x"), "Mine");
        assert_eq!(display_name(" ", Some("Title"), "https://a.org/x"), "Title");
        assert_eq!(display_name("", None, "https://a.org/x"), "a.org");
    }
}
