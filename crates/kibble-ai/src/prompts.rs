//! Prompt builders and tolerant parsers for provider output.

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;

use crate::{DiscoveryRequest, FactsRequest, SummarizeRequest};

static NUMBERING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:\d+[\.\)]\s*|[-*]\s+)").expect("valid regex"));

/// Titles beyond this many are left out of the summarize prompt.
pub const MAX_AVOID_TITLES: usize = 30;

fn word_bounds(min_words: u32, max_words: u32, noun: &str) -> Option<String> {
    match (min_words, max_words) {
        (0, 0) => None,
        (min, 0) => Some(format!("Each {noun} should be at least {min} words long.")),
        (0, max) => Some(format!("Each {noun} should be at most {max} words long.")),
        (min, max) => Some(format!("Each {noun} should be between {min} and {max} words long.")),
    }
}

fn wrap_research(heading: &str, intro: &str, material: &str, prompt: String) -> String {
    format!("=== {heading} ===\n{intro}\n\n{material}\n\n=== END {heading} ===\n\n{prompt}")
}

pub fn facts_prompt(request: &FactsRequest<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Generate exactly {} unique, interesting, and accurate facts about the topic: \"{}\".",
        request.count, request.topic_name
    );
    if !request.description.is_empty() {
        let _ = writeln!(out, "Topic description: {}", request.description);
    }
    if !request.custom_instructions.is_empty() {
        let _ = writeln!(out, "Additional instructions: {}", request.custom_instructions);
    }
    if !request.tone_instructions.is_empty() {
        let _ = writeln!(out, "Tone and style: {}", request.tone_instructions);
    }
    if let Some(bounds) = word_bounds(request.min_words, request.max_words, "fact") {
        let _ = writeln!(out, "{bounds}");
    }
    out.push_str(
        "\nIMPORTANT: Return ONLY the facts as a numbered list (1., 2., 3., etc.), one per line. \
         Do not include any other text, headers, or explanations. \
         Each fact should be a single, self-contained sentence or short paragraph.",
    );

    match request.research {
        Some(material) => wrap_research(
            "REFERENCE MATERIAL",
            "Use the following reference material to ensure accuracy and depth. \
             You may also draw on general knowledge, but prefer facts grounded in this material.",
            material,
            out,
        ),
        None => out,
    }
}

pub fn discovery_prompt(request: &DiscoveryRequest<'_>) -> String {
    let mut out = format!(
        "You are a helpful assistant that discovers reliable web sources for news topics.\n\n\
         Topic: {}\nDescription: {}\n\n",
        request.topic_name, request.description
    );
    if !request.sourcing_instructions.is_empty() {
        out.push_str(request.sourcing_instructions);
        out.push_str("\n\n");
    }

    if !request.catalog.is_empty() {
        out.push_str(
            "Here are known-good RSS feeds that may be relevant to this topic. \
             PREFER these feeds when they match the topic well, as they are verified to work:\n\n",
        );
        for feed in request.catalog {
            let _ = writeln!(out, "- {} ({})", feed.name, feed.url);
        }
        out.push_str("\nYou may include additional sources beyond this list if needed to cover the topic well.\n\n");
    }

    if !request.community_domains.is_empty() {
        out.push_str(
            "These sites are linked most often by related discussion communities this week. \
             Consider their RSS feeds or news sections:\n\n",
        );
        for rank in request.community_domains {
            let _ = writeln!(out, "- {} ({} posts, total score {})", rank.domain, rank.count, rank.total_score);
        }
        out.push('\n');
    }

    out.push_str(
        r#"Find 4-8 reliable sources that provide ongoing news and updates related to this topic. Sources can include:
- News websites and RSS feeds
- Reddit subreddits (format as https://reddit.com/r/subredditname)
- Technical blogs or official sources

For Reddit, include 1-2 relevant subreddits if they exist for this topic. Choose active subreddits with engaged communities.

For each source, provide:
1. The URL (must be a real, working URL)
2. A short name for the source
3. A brief description of what content it provides

IMPORTANT: Return ONLY a valid JSON array with no additional text, markdown, or explanation.

Format:
[
  {"url": "https://example.com/feed", "name": "Example News", "description": "Daily updates on topic"},
  {"url": "https://reddit.com/r/technology", "name": "r/technology", "description": "Tech news and discussion"}
]"#,
    );

    match request.research {
        Some(material) => wrap_research(
            "BACKGROUND RESEARCH",
            "The following research material provides context about this topic. \
             Use it to identify more specific, niche sources that cover this subject area.",
            material,
            out,
        ),
        None => out,
    }
}

pub fn summarize_prompt(request: &SummarizeRequest<'_>) -> String {
    let mut out = format!(
        "You are a news summarization assistant. Analyze the following scraped content and create clear, \
         informative news summaries.\n\nTopic: {}\n\n",
        request.topic_name
    );
    if !request.summarizing_instructions.is_empty() {
        out.push_str(request.summarizing_instructions);
        out.push_str("\n\n");
    }
    if !request.tone_instructions.is_empty() {
        let _ = write!(out, "Tone and style: {}\n\n", request.tone_instructions);
    }
    if let Some(bounds) = word_bounds(request.min_words, request.max_words, "story summary") {
        let _ = write!(out, "{bounds}\n\n");
    }

    out.push_str("Scraped Content:\n");
    for (i, content) in request.contents.iter().enumerate() {
        let _ = write!(
            out,
            "\n--- Source {}: {} ---\nURL: {}\n{}\n",
            i + 1,
            content.source_name,
            content.url,
            content.content
        );
    }

    if !request.recent_titles.is_empty() {
        out.push_str("\nThese stories were already published recently. Do NOT repeat them or cover the same events:\n");
        for title in request.recent_titles.iter().take(MAX_AVOID_TITLES) {
            let _ = writeln!(out, "- {title}");
        }
    }

    let _ = write!(
        out,
        r#"
From the content above, identify the {count} most interesting and relevant news stories.

IMPORTANT FILTERING RULES:
- ONLY include content that DIRECTLY relates to the topic "{topic}"
- Skip any content that is off-topic or only tangentially related
- For Reddit posts, focus on substantive discussions and news, not casual comments or memes
- Prioritize recent, newsworthy content over general discussion

For each story:
1. Create a compelling headline (title)
2. Write a summary focusing on key facts and why this story matters
3. Include the source URL where the story was found
4. Include the source name/title

IMPORTANT: Return ONLY a valid JSON array with no additional text, markdown, or explanation.

Format:
[
  {{"title": "Headline Here", "summary": "Summary text here...", "source_url": "https://source.com/article", "source_title": "Source Name"}}
]"#,
        count = request.count,
        topic = request.topic_name,
    );
    out
}

pub fn search_queries_prompt(topic_name: &str, description: &str) -> String {
    format!(
        "Generate 3-5 specific search queries for finding factual information about: \"{topic_name}\"\n\
         Description: {description}\n\n\
         Return ONLY the search queries as a numbered list, one per line. \
         Each query should target a different aspect of the topic.\n\
         Make queries specific enough to find Wikipedia articles or authoritative sources."
    )
}

/// One item per non-blank line with `1.`, `1)`, `-` or `*` prefixes removed.
pub fn parse_numbered_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| NUMBERING_RE.replace(line, "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Strips a surrounding markdown code fence.
pub fn clean_json_response(response: &str) -> &str {
    let trimmed = response.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    unfenced.strip_suffix("```").unwrap_or(unfenced).trim()
}

fn is_json(candidate: &str) -> bool {
    serde_json::from_str::<serde::de::IgnoredAny>(candidate).is_ok()
}

fn slice_between(raw: &str, open: char, close: char) -> Option<&str> {
    let start = raw.find(open)?;
    let end = raw.rfind(close)?;
    (end > start).then(|| &raw[start..=end])
}

/// Best-effort JSON document out of a chatty completion: as-is, then
/// without code fences, then the outermost `[..]`, then the outermost `{..}`.
pub fn extract_json(raw: &str) -> String {
    let raw = raw.trim();
    if is_json(raw) {
        return raw.to_string();
    }
    let cleaned = clean_json_response(raw);
    if is_json(cleaned) {
        return cleaned.to_string();
    }
    for (open, close) in [('[', ']'), ('{', '}')] {
        if let Some(candidate) = slice_between(raw, open, close) {
            if is_json(candidate) {
                return candidate.to_string();
            }
        }
    }
    cleaned.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kibble_adapters::{CatalogFeed, DomainRank};
    use kibble_core::ScrapedContent;

    #[test]
    fn numbering_styles_are_stripped() {
        let parsed = parse_numbered_list("  1. First\n2) Second\n\n- Third\n* Fourth\n10.Fifth\nPlain line\n3.");
        assert_eq!(parsed, vec!["First", "Second", "Third", "Fourth", "Fifth", "Plain line"]);
    }

    #[test]
    fn hyphenated_words_are_not_bullets() {
        assert_eq!(parse_numbered_list("-5 degrees is cold"), vec!["-5 degrees is cold"]);
    }

    #[test]
    fn json_is_found_behind_fences_and_prose() {
        assert_eq!(extract_json("```json\n[1, 2]\n```"), "[1, 2]");
        assert_eq!(extract_json("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(
            extract_json("Here are the sources you asked for: [{\"url\": \"x\"}] Hope this helps!"),
            "[{\"url\": \"x\"}]"
        );
        assert_eq!(extract_json("Result: {\"a\": 1} done"), "{\"a\": 1}");
        assert_eq!(extract_json("no json here"), "no json here");
    }

    #[test]
    fn facts_prompt_carries_instructions_and_bounds() {
        let prompt = facts_prompt(&FactsRequest {
            topic_name: "Space",
            description: "The cosmos",
            count: 3,
            custom_instructions: "Avoid Mars.",
            tone_instructions: "Playful.",
            min_words: 10,
            max_words: 0,
            research: None,
        });
        assert!(prompt.starts_with("Generate exactly 3 unique"));
        assert!(prompt.contains("topic: \"Space\""));
        assert!(prompt.contains("Topic description: The cosmos\n"));
        assert!(prompt.contains("Additional instructions: Avoid Mars.\n"));
        assert!(prompt.contains("Tone and style: Playful.\n"));
        assert!(prompt.contains("at least 10 words"));
        assert!(!prompt.contains("REFERENCE MATERIAL"));
    }

    #[test]
    fn research_material_is_prepended() {
        let prompt = facts_prompt(&FactsRequest {
            topic_name: "Tardigrades",
            count: 2,
            research: Some("## Tardigrade\nMicro-animals."),
            ..FactsRequest::default()
        });
        assert!(prompt.starts_with("=== REFERENCE MATERIAL ==="));
        assert!(prompt.contains("## Tardigrade\nMicro-animals.\n\n=== END REFERENCE MATERIAL ===\n\nGenerate exactly 2"));
    }

    #[test]
    fn discovery_prompt_lists_catalog_and_domains() {
        let catalog = vec![CatalogFeed {
            name: "Space.com".into(),
            url: "https://www.space.com/feeds/all".into(),
            description: String::new(),
        }];
        let domains = vec![DomainRank {
            domain: "esa.int".into(),
            count: 4,
            total_score: 900,
            sample_urls: Vec::new(),
        }];
        let prompt = discovery_prompt(&DiscoveryRequest {
            topic_name: "Space",
            description: "Launches",
            sourcing_instructions: "Prefer agencies.",
            catalog: &catalog,
            community_domains: &domains,
            research: None,
        });
        assert!(prompt.contains("Topic: Space\nDescription: Launches\n\nPrefer agencies.\n\n"));
        assert!(prompt.contains("- Space.com (https://www.space.com/feeds/all)\n"));
        assert!(prompt.contains("- esa.int (4 posts, total score 900)\n"));
        assert!(prompt.ends_with(']'));
    }

    #[test]
    fn summarize_prompt_numbers_sources_and_lists_recent_titles() {
        let contents = vec![
            ScrapedContent {
                url: "https://a.org/feed".into(),
                source_name: "A".into(),
                content: "alpha".into(),
            },
            ScrapedContent {
                url: "https://b.org".into(),
                source_name: "B".into(),
                content: "beta".into(),
            },
        ];
        let recent: Vec<String> = (0..40).map(|i| format!("Old story {i}")).collect();
        let prompt = summarize_prompt(&SummarizeRequest {
            topic_name: "Rust",
            count: 4,
            summarizing_instructions: "",
            tone_instructions: "Dry.",
            min_words: 20,
            max_words: 60,
            contents: &contents,
            recent_titles: &recent,
        });
        assert!(prompt.contains("\n--- Source 1: A ---\nURL: https://a.org/feed\nalpha\n"));
        assert!(prompt.contains("\n--- Source 2: B ---\nURL: https://b.org\nbeta\n"));
        assert!(prompt.contains("between 20 and 60 words"));
        assert!(prompt.contains("- Old story 29\n"));
        assert!(!prompt.contains("Old story 30"));
        assert!(prompt.contains("identify the 4 most interesting"));
        assert!(prompt.contains("DIRECTLY relates to the topic \"Rust\""));
        assert!(prompt.contains("{\"title\": \"Headline Here\""));
    }
}
