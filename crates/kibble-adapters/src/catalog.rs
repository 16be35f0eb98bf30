//! Curated feed catalog matched by topic keywords.

use std::collections::HashSet;
use std::sync::LazyLock;

use serde::Deserialize;

const CATALOG_YAML: &str = include_str!("../data/feeds.yaml");
const MAX_RESULTS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogFeed {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct Catalog {
    categories: Vec<Category>,
}

#[derive(Debug, Deserialize)]
struct Category {
    name: String,
    feeds: Vec<CatalogFeed>,
}

static CATALOG: LazyLock<Vec<Category>> = LazyLock::new(|| {
    serde_yaml::from_str::<Catalog>(CATALOG_YAML)
        .map(|c| c.categories)
        .unwrap_or_else(|err| {
            tracing::error!(error = %err, "embedded feed catalog failed to parse");
            Vec::new()
        })
});

/// Feeds whose category, name or description contains any keyword of at
/// least three characters from the topic name and description. A category
/// hit includes every feed in it.
pub fn find_relevant(topic_name: &str, description: &str) -> Vec<CatalogFeed> {
    let query = format!("{topic_name} {description}").to_lowercase();
    let keywords: Vec<&str> = query
        .split_whitespace()
        .filter(|w| w.chars().count() >= 3)
        .collect();
    if keywords.is_empty() {
        return Vec::new();
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for category in CATALOG.iter() {
        let category_name = category.name.to_lowercase();
        let category_hit = keywords.iter().any(|kw| category_name.contains(kw));
        for feed in &category.feeds {
            let hit = category_hit || {
                let haystack = format!("{} {}", feed.name, feed.description).to_lowercase();
                keywords.iter().any(|kw| haystack.contains(kw))
            };
            if hit && seen.insert(feed.url.clone()) {
                out.push(feed.clone());
            }
        }
    }
    out.truncate(MAX_RESULTS);
    out
}
