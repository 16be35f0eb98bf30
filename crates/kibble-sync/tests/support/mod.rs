#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kibble_adapters::{
    CandidateValidator, ExtractError, LinkPost, SocialPost, SocialThreadClient, SourceScraper, ValidationOutcome,
};
use kibble_ai::{AiClient, ChatError, ChatProvider, ChatRequest, ChatResponse, ProviderSelector, ResearchSource};
use kibble_core::{NewsTopic, ScrapedContent, SettingsSnapshot, Topic};
use kibble_storage::MemoryRepository;
use kibble_sync::{Collaborators, Scheduler, SchedulerConfig};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Facts,
    Discovery,
    Summarize,
    Other,
}

impl Purpose {
    fn of(request: &ChatRequest) -> Self {
        let prompt: String = request.messages.iter().map(|m| m.content.as_str()).collect();
        if prompt.contains("discovers reliable web sources") {
            Self::Discovery
        } else if prompt.contains("news summarization assistant") {
            Self::Summarize
        } else if prompt.starts_with("Generate exactly") {
            Self::Facts
        } else {
            Self::Other
        }
    }
}

/// Lets a test hold a provider call open until it says otherwise.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// Counts calls that are running at the same time.
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct ScriptedProvider {
    pub facts: String,
    pub sources: String,
    pub stories: String,
    pub panic_on: Option<Purpose>,
    /// Panic payload; defaults to "provider exploded during <purpose>".
    pub panic_text: Option<String>,
    pub gate: Option<(Purpose, Arc<Gate>)>,
    /// Simulated latency applied to every call.
    pub latency: Duration,
    pub in_flight: InFlight,
    pub calls: Mutex<Vec<(Purpose, String)>>,
}

impl ScriptedProvider {
    pub fn calls(&self, purpose: Purpose) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|(p, _)| *p == purpose)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        let purpose = Purpose::of(request);
        let prompt: String = request.messages.iter().map(|m| m.content.as_str()).collect();
        self.calls.lock().expect("calls lock").push((purpose, prompt));
        let _running = self.in_flight.enter();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some((gated, gate)) = &self.gate {
            if *gated == purpose {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
        }
        if self.panic_on == Some(purpose) {
            match &self.panic_text {
                Some(text) => panic!("{text}"),
                None => panic!("provider exploded during {purpose:?}"),
            }
        }

        let content = match purpose {
            Purpose::Facts => self.facts.clone(),
            Purpose::Discovery => self.sources.clone(),
            Purpose::Summarize => self.stories.clone(),
            Purpose::Other => String::new(),
        };
        Ok(ChatResponse {
            content,
            tokens_used: 120,
            model: "scripted-model".to_string(),
            provider: "scripted".to_string(),
        })
    }
}

pub struct FixedSelector(pub Arc<ScriptedProvider>);

impl ProviderSelector for FixedSelector {
    fn select(&self, _topic_override: Option<&str>, _snapshot: &SettingsSnapshot) -> Arc<dyn ChatProvider> {
        self.0.clone()
    }
}

#[derive(Debug, Clone)]
pub enum ScrapeBehavior {
    Content(String),
    Fail(String),
    Hang,
}

/// Scraper keyed by URL. Unknown URLs return a healthy page.
#[derive(Default)]
pub struct ScriptedScraper {
    behaviors: Mutex<HashMap<String, ScrapeBehavior>>,
    latency: Mutex<Duration>,
    pub in_flight: InFlight,
}

impl ScriptedScraper {
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().expect("latency lock") = latency;
    }

    pub fn set(&self, url: &str, behavior: ScrapeBehavior) {
        self.behaviors
            .lock()
            .expect("behaviors lock")
            .insert(url.to_string(), behavior);
    }
}

#[async_trait]
impl SourceScraper for ScriptedScraper {
    async fn scrape(&self, url: &str, name: &str) -> Result<ScrapedContent, ExtractError> {
        let behavior = self.behaviors.lock().expect("behaviors lock").get(url).cloned();
        let latency = *self.latency.lock().expect("latency lock");
        let _running = self.in_flight.enter();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match behavior {
            Some(ScrapeBehavior::Fail(message)) => Err(ExtractError::Message(message)),
            Some(ScrapeBehavior::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ExtractError::Message("woke up".into()))
            }
            Some(ScrapeBehavior::Content(content)) => Ok(ScrapedContent {
                url: url.to_string(),
                source_name: name.to_string(),
                content,
            }),
            None => Ok(ScrapedContent {
                url: url.to_string(),
                source_name: name.to_string(),
                content: format!("HEADLINE: News from {url}\n{}", "Something happened today. ".repeat(20)),
            }),
        }
    }
}

/// Accepts every candidate except the listed URLs. With a gate, every
/// validation waits for its release.
#[derive(Default)]
pub struct ListValidator {
    pub rejected: Vec<String>,
    pub gate: Option<Arc<Gate>>,
}

#[async_trait]
impl CandidateValidator for ListValidator {
    async fn validate(&self, url: &str, name: &str) -> ValidationOutcome {
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let ok = !self.rejected.iter().any(|r| r == url);
        ValidationOutcome {
            url: url.to_string(),
            name: name.to_string(),
            ok,
            reason: if ok { String::new() } else { "rejected by test".to_string() },
            feed_url: None,
        }
    }
}

pub struct QuietSocial;

#[async_trait]
impl SocialThreadClient for QuietSocial {
    async fn fetch_posts(&self, _community: &str) -> Result<Vec<SocialPost>, ExtractError> {
        Ok(Vec::new())
    }

    async fn fetch_top_links(&self, _community: &str, _limit: usize) -> Result<Vec<LinkPost>, ExtractError> {
        Ok(Vec::new())
    }
}

/// Encyclopedia with one article per query.
pub struct StubResearch;

#[async_trait]
impl ResearchSource for StubResearch {
    async fn search(&self, query: &str, _limit: usize) -> anyhow::Result<Vec<String>> {
        Ok(vec![format!("Article about {query}")])
    }

    async fn summary(&self, title: &str) -> anyhow::Result<String> {
        Ok(format!("## {title}\nBackground material."))
    }
}

pub struct Harness {
    pub repo: Arc<MemoryRepository>,
    pub provider: Arc<ScriptedProvider>,
    pub scraper: Arc<ScriptedScraper>,
    pub scheduler: Scheduler,
}

pub fn harness(provider: ScriptedProvider, config: SchedulerConfig) -> Harness {
    harness_with(provider, ListValidator::default(), config)
}

pub fn harness_with(provider: ScriptedProvider, validator: ListValidator, config: SchedulerConfig) -> Harness {
    build(provider, validator, AiClient::new(), config)
}

/// Harness whose AI client gathers research for niche topics.
pub fn research_harness(provider: ScriptedProvider, config: SchedulerConfig) -> Harness {
    let ai = AiClient::new().with_research(Arc::new(StubResearch));
    build(provider, ListValidator::default(), ai, config)
}

fn build(provider: ScriptedProvider, validator: ListValidator, ai: AiClient, config: SchedulerConfig) -> Harness {
    let repo = Arc::new(MemoryRepository::new());
    let provider = Arc::new(provider);
    let scraper = Arc::new(ScriptedScraper::default());
    let collab = Collaborators {
        repo: repo.clone(),
        providers: Arc::new(FixedSelector(provider.clone())),
        scraper: scraper.clone(),
        validator: Arc::new(validator),
        social: Arc::new(QuietSocial),
        ai,
    };
    Harness {
        repo,
        provider,
        scraper,
        scheduler: Scheduler::new(collab, config),
    }
}

pub fn topic(id: i64, name: &str, facts_per_refresh: u32) -> Topic {
    Topic {
        id,
        name: name.to_string(),
        description: String::new(),
        is_active: true,
        facts_per_refresh,
        refresh_interval_minutes: 60,
        summary_min_words: 0,
        summary_max_words: 0,
        last_refreshed_at: None,
        ai_provider: None,
        is_niche: false,
    }
}

pub fn news_topic(id: i64, name: &str, stories_per_refresh: u32) -> NewsTopic {
    NewsTopic {
        id,
        name: name.to_string(),
        description: String::new(),
        is_active: true,
        stories_per_refresh,
        refresh_interval_minutes: 60,
        summary_min_words: 0,
        summary_max_words: 0,
        last_refreshed_at: None,
        ai_provider: None,
        is_niche: false,
    }
}
