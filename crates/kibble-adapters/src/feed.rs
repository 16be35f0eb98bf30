use std::sync::LazyLock;

use feed_rs::model::{Entry, Link};
use regex::Regex;

use crate::{clean_text, ExtractError};

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedExtraction {
    pub title: Option<String>,
    pub text: String,
}

/// Replaces every tag with a space and collapses whitespace.
pub fn strip_tags(html: &str) -> String {
    clean_text(&TAG_RE.replace_all(html, " "))
}

fn entry_link(links: &[Link]) -> Option<&str> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("") | Some("alternate")))
        .or_else(|| links.first())
        .map(|l| l.href.trim())
        .filter(|href| !href.is_empty())
}

fn entry_body(entry: &Entry) -> Option<String> {
    entry
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .filter(|b| !b.trim().is_empty())
        .or_else(|| entry.summary.as_ref().map(|s| s.content.clone()))
        .filter(|b| !b.trim().is_empty())
}

/// Parses RSS 2.0 or Atom into `ARTICLE/LINK/DATE/body` blocks. Full content
/// is preferred over the summary; entries without a title are skipped.
pub fn extract_feed(bytes: &[u8]) -> Result<FeedExtraction, ExtractError> {
    let feed = feed_rs::parser::parse(bytes).map_err(|e| ExtractError::Feed(e.to_string()))?;
    let mut out = String::new();

    for entry in &feed.entries {
        let Some(title) = entry
            .title
            .as_ref()
            .map(|t| clean_text(&t.content))
            .filter(|t| !t.is_empty())
        else {
            continue;
        };

        out.push_str("ARTICLE: ");
        out.push_str(&title);
        out.push('\n');
        if let Some(link) = entry_link(&entry.links) {
            out.push_str("LINK: ");
            out.push_str(link);
            out.push('\n');
        }
        if let Some(date) = entry.published.or(entry.updated) {
            out.push_str("DATE: ");
            out.push_str(&date.to_rfc2822());
            out.push('\n');
        }
        if let Some(body) = entry_body(entry) {
            out.push_str(&strip_tags(&body));
            out.push_str("\n\n");
        }
    }

    let text = out.trim().to_string();
    if text.is_empty() {
        return Err(ExtractError::Feed("feed has no titled entries".into()));
    }

    Ok(FeedExtraction {
        title: feed.title.map(|t| clean_text(&t.content)).filter(|t| !t.is_empty()),
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_become_spaces() {
        assert_eq!(strip_tags("<p>Hello<br/>world</p>  <b>again</b>"), "Hello world again");
    }

    #[test]
    fn atom_entries_prefer_alternate_links_and_content() {
        let atom = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Rust Blog</title>
  <id>https://blog.rust-lang.org/</id>
  <updated>2026-09-01T00:00:00Z</updated>
  <entry>
    <title>Announcing Rust 1.99</title>
    <id>https://blog.rust-lang.org/1.99</id>
    <updated>2026-09-01T00:00:00Z</updated>
    <link rel="self" href="https://blog.rust-lang.org/self"/>
    <link rel="alternate" href="https://blog.rust-lang.org/2026/09/01/Rust-1.99.html"/>
    <summary>Short summary</summary>
    <content type="html">&lt;p&gt;The full release notes&lt;/p&gt;</content>
  </entry>
</feed>"#;
        let feed = extract_feed(atom.as_bytes()).expect("atom");
        assert_eq!(feed.title.as_deref(), Some("Rust Blog"));
        assert!(feed.text.contains("ARTICLE: Announcing Rust 1.99"));
        assert!(feed.text.contains("LINK: https://blog.rust-lang.org/2026/09/01/Rust-1.99.html"));
        assert!(feed.text.contains("The full release notes"));
        assert!(!feed.text.contains("Short summary"));
    }

    #[test]
    fn html_documents_are_not_feeds() {
        assert!(extract_feed(b"<html><body><p>hello</p></body></html>").is_err());
    }
}
