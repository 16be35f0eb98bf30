//! Operator-facing error codes derived from rendered error text.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    ModelNotFound,
    NoSources,
    NoContent,
    DiscoveryError,
    ScrapeError,
    ParseError,
    RateLimited,
    AuthError,
    BadRequest,
    NotFound,
    ServerError,
    EmptyResponse,
    ConnectionError,
    SummarizeError,
    Panic,
    AiError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ModelNotFound => "model_not_found",
            Self::NoSources => "no_sources",
            Self::NoContent => "no_content",
            Self::DiscoveryError => "discovery_error",
            Self::ScrapeError => "scrape_error",
            Self::ParseError => "parse_error",
            Self::RateLimited => "rate_limited",
            Self::AuthError => "auth_error",
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::ServerError => "server_error",
            Self::EmptyResponse => "empty_response",
            Self::ConnectionError => "connection_error",
            Self::SummarizeError => "summarize_error",
            Self::Panic => "panic",
            Self::AiError => "ai_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered rules; the first rule with any matching needle wins. Needles are
/// lowercase and matched against the lowercased message.
const RULES: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::Timeout,
        &["deadline exceeded", "timed out", "context canceled", "cancelled"],
    ),
    (ErrorKind::NoSources, &["no sources available"]),
    (
        ErrorKind::NoContent,
        &["failed to scrape any content", "insufficient content"],
    ),
    (ErrorKind::DiscoveryError, &["discover sources"]),
    (ErrorKind::ScrapeError, &["scrape error", "failed to visit"]),
    (ErrorKind::ParseError, &["failed to parse", "json"]),
    (ErrorKind::RateLimited, &["status 429", "rate limit"]),
    (ErrorKind::AuthError, &["status 401", "status 403", "api key"]),
    (ErrorKind::BadRequest, &["status 400"]),
    (ErrorKind::NotFound, &["status 404"]),
    (ErrorKind::ServerError, &["status 5"]),
    (
        ErrorKind::EmptyResponse,
        &["empty response", "no parseable facts"],
    ),
    (
        ErrorKind::ConnectionError,
        &[
            "connection refused",
            "no such host",
            "dns error",
            "dial tcp",
            "error trying to connect",
            "tcp connect error",
        ],
    ),
    (ErrorKind::SummarizeError, &["summarize content"]),
    (ErrorKind::Panic, &["panic"]),
];

/// Maps an error message to its code. Unrecognized messages are `AiError`.
pub fn classify(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    // Ranks directly after timeouts.
    if lower.contains("model") && lower.contains("not found") && !contains_any(&lower, RULES[0].1) {
        return ErrorKind::ModelNotFound;
    }
    RULES
        .iter()
        .find(|(_, needles)| contains_any(&lower, needles))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::AiError)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_status_errors_are_classified() {
        assert_eq!(classify("gemini returned status 429: slow down"), ErrorKind::RateLimited);
        assert_eq!(classify("chutes returned status 401: nope"), ErrorKind::AuthError);
        assert_eq!(classify("gemini API key not configured"), ErrorKind::AuthError);
        assert_eq!(classify("ollama returned status 400: bad"), ErrorKind::BadRequest);
        assert_eq!(classify("ollama returned status 404: gone"), ErrorKind::NotFound);
        assert_eq!(classify("gemini returned status 503: busy"), ErrorKind::ServerError);
    }

    #[test]
    fn pipeline_context_strings_are_classified() {
        assert_eq!(classify("no sources available for topic"), ErrorKind::NoSources);
        assert_eq!(
            classify("failed to scrape any content from active sources"),
            ErrorKind::NoContent
        );
        assert_eq!(
            classify("discover sources: gemini returned status 500: x"),
            ErrorKind::DiscoveryError
        );
        assert_eq!(
            classify("summarize content: failed to parse stories JSON from gemini: eof"),
            ErrorKind::ParseError
        );
        assert_eq!(classify("summarize content: something odd"), ErrorKind::SummarizeError);
        assert_eq!(classify("empty response from ollama"), ErrorKind::EmptyResponse);
        assert_eq!(classify("no parseable facts in response from gemini"), ErrorKind::EmptyResponse);
        assert_eq!(classify("panic: index out of bounds"), ErrorKind::Panic);
    }

    #[test]
    fn timeouts_win_over_everything_else() {
        assert_eq!(
            classify("summarize content: deadline exceeded after 480s"),
            ErrorKind::Timeout
        );
        assert_eq!(classify("ollama request failed: operation timed out"), ErrorKind::Timeout);
        assert_eq!(classify("refresh cancelled"), ErrorKind::Timeout);
    }

    #[test]
    fn missing_models_are_reported_before_status_codes() {
        assert_eq!(
            classify("ollama returned status 404: model \"llama9\" not found"),
            ErrorKind::ModelNotFound
        );
    }

    #[test]
    fn connection_failures_and_fallback() {
        assert_eq!(
            classify("gemini request failed: error trying to connect: dns error"),
            ErrorKind::ConnectionError
        );
        assert_eq!(classify("dial tcp 127.0.0.1:11434: connection refused"), ErrorKind::ConnectionError);
        assert_eq!(classify("something unexpected"), ErrorKind::AiError);
        assert_eq!(ErrorKind::AiError.to_string(), "ai_error");
    }
}
