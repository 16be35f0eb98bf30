use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kibble_storage::{FetchOptions, HttpFetcher};
use serde::Serialize;
use tracing::{debug, info};

use crate::html::discover_feed_link;
use crate::social::subreddit_from_url;
use crate::{is_feed_url, ExtractError, SourceScraper};

pub const MIN_VALID_CHARS: usize = 200;
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(15);
pub const FEED_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub url: String,
    pub name: String,
    pub ok: bool,
    pub reason: String,
    /// Advertised feed the page pointed at, if any. Persist this instead of `url`.
    pub feed_url: Option<String>,
}

impl ValidationOutcome {
    fn rejected(url: &str, name: &str, reason: impl Into<String>, feed_url: Option<String>) -> Self {
        Self {
            url: url.to_string(),
            name: name.to_string(),
            ok: false,
            reason: reason.into(),
            feed_url,
        }
    }

    /// The URL that should be persisted for an accepted candidate.
    pub fn effective_url(&self) -> &str {
        self.feed_url.as_deref().unwrap_or(&self.url)
    }
}

/// Requires an http(s) scheme and a host.
pub fn validate_url(raw: &str) -> Result<url::Url, ExtractError> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| ExtractError::InvalidUrl(format!("invalid URL format: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ExtractError::InvalidUrl("URL must use http or https scheme".into()));
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(ExtractError::InvalidUrl("URL must have a host".into()));
    }
    Ok(parsed)
}

#[async_trait]
pub trait CandidateValidator: Send + Sync {
    async fn validate(&self, url: &str, name: &str) -> ValidationOutcome;
}

/// Runs one isolated extraction pass against a candidate, after trying feed
/// auto-discovery on ordinary pages.
pub struct SourceValidator {
    http: Arc<HttpFetcher>,
    scraper: Arc<dyn SourceScraper>,
    timeout: Duration,
}

impl SourceValidator {
    pub fn new(http: Arc<HttpFetcher>, scraper: Arc<dyn SourceScraper>) -> Self {
        Self {
            http,
            scraper,
            timeout: VALIDATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn discover_feed(&self, page_url: &str) -> Option<String> {
        let options = FetchOptions {
            timeout: Some(FEED_DISCOVERY_TIMEOUT),
            ..FetchOptions::default()
        };
        match self.http.fetch(page_url, &options).await {
            Ok(response) => discover_feed_link(&response.text(), &response.final_url),
            Err(err) => {
                debug!(page_url, error = %err, "feed discovery fetch failed");
                None
            }
        }
    }
}

#[async_trait]
impl CandidateValidator for SourceValidator {
    async fn validate(&self, url: &str, name: &str) -> ValidationOutcome {
        if let Err(err) = validate_url(url) {
            return ValidationOutcome::rejected(url, name, err.to_string(), None);
        }

        let feed_url = if subreddit_from_url(url).is_some() || is_feed_url(url) {
            None
        } else {
            self.discover_feed(url).await
        };
        if let Some(feed) = &feed_url {
            info!(url, feed, "discovered feed for candidate source");
        }
        let target = feed_url.as_deref().unwrap_or(url);

        let scraped = match tokio::time::timeout(self.timeout, self.scraper.scrape(target, name)).await {
            Ok(Ok(scraped)) => scraped,
            Ok(Err(err)) => return ValidationOutcome::rejected(url, name, err.to_string(), feed_url),
            Err(_) => {
                return ValidationOutcome::rejected(
                    url,
                    name,
                    ExtractError::Timeout(target.to_string()).to_string(),
                    feed_url,
                )
            }
        };

        let chars = scraped.content.chars().count();
        if chars < MIN_VALID_CHARS {
            return ValidationOutcome::rejected(url, name, format!("insufficient content: {chars} chars"), feed_url);
        }

        let name = if name.trim().is_empty() {
            scraped.source_name
        } else {
            name.to_string()
        };
        ValidationOutcome {
            url: url.to_string(),
            name,
            ok: true,
            reason: String::new(),
            feed_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kibble_core::ScrapedContent;
    use kibble_storage::HttpClientConfig;

    struct FixedScraper(usize);

    #[async_trait]
    impl SourceScraper for FixedScraper {
        async fn scrape(&self, url: &str, _name: &str) -> Result<ScrapedContent, ExtractError> {
            Ok(ScrapedContent {
                url: url.to_string(),
                source_name: "Fixture".into(),
                content: "x".repeat(self.0),
            })
        }
    }

    struct SlowScraper;

    #[async_trait]
    impl SourceScraper for SlowScraper {
        async fn scrape(&self, _url: &str, _name: &str) -> Result<ScrapedContent, ExtractError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(ExtractError::Message("unreachable".into()))
        }
    }

    fn validator(scraper: Arc<dyn SourceScraper>) -> SourceValidator {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("client"));
        SourceValidator::new(http, scraper)
    }

    #[test]
    fn url_checks_require_scheme_and_host() {
        assert!(validate_url("https://example.org/feed").is_ok());
        assert!(validate_url("ftp://example.org").is_err());
        assert!(validate_url("example.org").is_err());
    }

    #[tokio::test]
    async fn short_extractions_are_rejected() {
        // Feed-shaped URLs skip discovery, so no network is touched.
        let outcome = validator(Arc::new(FixedScraper(150)))
            .validate("https://example.org/feed", "")
            .await;
        assert!(!outcome.ok);
        assert_eq!(outcome.reason, "insufficient content: 150 chars");
    }

    #[tokio::test]
    async fn accepted_candidates_take_the_extracted_name() {
        let outcome = validator(Arc::new(FixedScraper(250)))
            .validate("https://example.org/feed", "")
            .await;
        assert!(outcome.ok);
        assert_eq!(outcome.name, "Fixture");
        assert_eq!(outcome.effective_url(), "https://example.org/feed");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_extractions_time_out() {
        let outcome = validator(Arc::new(SlowScraper))
            .validate("https://www.reddit.com/r/rust/", "r/rust")
            .await;
        assert!(!outcome.ok);
        assert!(outcome.reason.contains("context deadline exceeded"));
    }

    #[tokio::test]
    async fn malformed_urls_never_reach_the_scraper() {
        let outcome = validator(Arc::new(FixedScraper(1000)))
            .validate("mailto:someone@example.org", "")
            .await;
        assert!(!outcome.ok);
        assert!(outcome.reason.contains("http or https"));
    }
}
