//! Character n-gram sets and Jaccard overlap for near-duplicate facts.

use std::collections::HashSet;

use tracing::warn;

pub const DEFAULT_NGRAM_SIZE: usize = 3;
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.6;

pub type GramSet = HashSet<String>;

/// Lowercases and collapses every run of non-alphanumeric characters to one space.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        } else {
            pending_space = true;
        }
    }
    out
}

/// |A ∩ B| / |A ∪ B|. Two empty sets are identical.
pub fn jaccard(a: &GramSet, b: &GramSet) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let intersection = small.iter().filter(|g| large.contains(*g)).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Stored form: a JSON array of grams, sorted so equal sets serialize identically.
pub fn grams_to_json(grams: &GramSet) -> String {
    let mut list: Vec<&str> = grams.iter().map(String::as_str).collect();
    list.sort_unstable();
    serde_json::to_string(&list).unwrap_or_else(|_| "[]".to_string())
}

/// Unreadable stored sets decode as empty.
pub fn grams_from_json(json: &str) -> GramSet {
    match serde_json::from_str::<Vec<String>>(json) {
        Ok(list) => list.into_iter().collect(),
        Err(err) => {
            warn!(error = %err, "discarding unreadable stored gram set");
            GramSet::new()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityEngine {
    gram_size: usize,
    threshold: f64,
}

impl Default for SimilarityEngine {
    fn default() -> Self {
        Self::new(DEFAULT_NGRAM_SIZE, DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl SimilarityEngine {
    pub fn new(gram_size: usize, threshold: f64) -> Self {
        Self {
            gram_size: gram_size.max(1),
            threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Distinct fixed-length substrings of the normalized text. Text shorter
    /// than one gram yields the empty set.
    pub fn grams(&self, text: &str) -> GramSet {
        let chars: Vec<char> = normalize(text).chars().collect();
        chars
            .windows(self.gram_size)
            .map(|w| w.iter().collect::<String>())
            .collect()
    }

    /// True when `candidate` overlaps any existing set at or above the threshold.
    pub fn is_too_similar(&self, candidate: &GramSet, existing: &[GramSet]) -> bool {
        existing.iter().any(|set| jaccard(candidate, set) >= self.threshold)
    }

    /// Keeps texts in order, dropping each one too similar to `existing` or to
    /// an earlier kept text. Returns the kept texts with their gram sets.
    pub fn dedupe_batch<'a>(
        &self,
        texts: impl IntoIterator<Item = &'a str>,
        existing: &mut Vec<GramSet>,
    ) -> (Vec<(&'a str, GramSet)>, usize) {
        let mut kept = Vec::new();
        let mut discarded = 0;
        for text in texts {
            let grams = self.grams(text);
            if self.is_too_similar(&grams, existing) {
                discarded += 1;
                continue;
            }
            existing.push(grams.clone());
            kept.push((text, grams));
        }
        (kept, discarded)
    }
}
