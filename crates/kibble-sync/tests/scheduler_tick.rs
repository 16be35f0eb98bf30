mod support;

use std::time::Duration;

use chrono::Utc;
use kibble_core::NewNewsSource;
use kibble_storage::Repository;
use kibble_sync::{RefreshKey, SchedulerConfig, TickSummary};
use support::{harness, news_topic, topic, Purpose, ScriptedProvider};
use tokio_util::sync::CancellationToken;

const STORIES: &str = r#"[{"title": "Launch window opens", "summary": "Rockets are ready.", "source_url": "https://ok.example.com"}]"#;

fn provider() -> ScriptedProvider {
    ScriptedProvider {
        facts: "1. Venus rotates backwards compared to most other planets.\n2. A day on Jupiter lasts just under ten hours.".to_string(),
        sources: "[]".to_string(),
        stories: STORIES.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn tick_purges_sessions_and_refreshes_only_due_topics() {
    let h = harness(provider(), SchedulerConfig::default());
    let now = Utc::now();
    h.repo.insert_session("expired", now - chrono::Duration::hours(1)).expect("session");
    h.repo.insert_session("live", now + chrono::Duration::hours(1)).expect("session");

    h.repo.insert_topic(topic(1, "Space", 2)).expect("topic");
    let mut inactive = topic(2, "Paused", 2);
    inactive.is_active = false;
    h.repo.insert_topic(inactive).expect("topic");
    let mut fresh = topic(3, "Fresh", 2);
    fresh.last_refreshed_at = Some(now);
    h.repo.insert_topic(fresh).expect("topic");

    h.repo.insert_news_topic(news_topic(4, "Launches", 1)).expect("news topic");
    let mut fresh_news = news_topic(5, "Recent", 1);
    fresh_news.last_refreshed_at = Some(now);
    h.repo.insert_news_topic(fresh_news).expect("news topic");
    h.repo
        .add_news_source(NewNewsSource {
            news_topic_id: 4,
            url: "https://ok.example.com".to_string(),
            name: "OK".to_string(),
            is_manual: true,
        })
        .await
        .expect("source");

    let cancel = CancellationToken::new();
    let summary = h.scheduler.tick(&cancel).await;
    assert_eq!(
        summary,
        TickSummary {
            sessions_purged: 1,
            facts_due: 1,
            news_due: 1,
            refreshed: 2,
            failed: 0,
            skipped: 0,
        }
    );
    assert_eq!(h.repo.session_count().expect("sessions"), 1);
    assert_eq!(h.repo.facts_for_topic(1).expect("facts").len(), 2);
    assert!(h.repo.facts_for_topic(2).expect("facts").is_empty());
    assert!(h.repo.facts_for_topic(3).expect("facts").is_empty());
    assert_eq!(h.repo.stories_for_topic(4).expect("stories").len(), 1);
    assert!(h.repo.stories_for_topic(5).expect("stories").is_empty());
    assert!(!h.scheduler.is_refreshing(RefreshKey::facts(1)));

    let again = h.scheduler.tick(&cancel).await;
    assert_eq!(again.facts_due, 0);
    assert_eq!(again.news_due, 0);
    assert_eq!(again.sessions_purged, 0);
    assert_eq!(h.provider.calls(Purpose::Facts).len(), 1);
}

#[tokio::test]
async fn failed_news_topic_waits_out_its_backoff() {
    let h = harness(provider(), SchedulerConfig::default());
    h.repo.insert_news_topic(news_topic(8, "Nowhere", 2)).expect("news topic");

    let cancel = CancellationToken::new();
    let first = h.scheduler.tick(&cancel).await;
    assert_eq!(first.news_due, 1);
    assert_eq!(first.failed, 1);

    let status = h.repo.get_refresh_status(8).await.expect("status").expect("row");
    assert_eq!(status.error_kind.as_deref(), Some("no_sources"));

    let second = h.scheduler.tick(&cancel).await;
    assert_eq!(second.news_due, 0);
    assert_eq!(h.provider.calls(Purpose::Discovery).len(), 1);
}

#[tokio::test]
async fn cancelled_tick_skips_pending_work() {
    let h = harness(provider(), SchedulerConfig::default());
    h.repo.insert_topic(topic(1, "Space", 2)).expect("topic");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = h.scheduler.tick(&cancel).await;
    assert_eq!(summary.facts_due, 1);
    assert_eq!(summary.skipped, 1);
    assert!(h.provider.calls(Purpose::Facts).is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_ticks_immediately_and_stops_on_cancel() {
    let config = SchedulerConfig {
        tick_interval: Duration::from_secs(60),
        ..SchedulerConfig::default()
    };
    let h = harness(provider(), config);
    h.repo.insert_topic(topic(1, "Space", 2)).expect("topic");

    let cancel = CancellationToken::new();
    let handle = {
        let scheduler = h.scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    while h.repo.facts_for_topic(1).expect("facts").is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run stops after cancel")
        .expect("join");

    assert_eq!(h.provider.calls(Purpose::Facts).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn at_most_three_facts_topics_refresh_at_once() {
    let slow = ScriptedProvider {
        latency: Duration::from_secs(5),
        ..provider()
    };
    let h = harness(slow, SchedulerConfig::default());
    for id in 1..=8 {
        h.repo.insert_topic(topic(id, &format!("Topic {id}"), 2)).expect("topic");
    }

    let summary = h.scheduler.tick(&CancellationToken::new()).await;
    assert_eq!(summary.facts_due, 8);
    assert_eq!(summary.refreshed, 8);
    assert_eq!(h.provider.in_flight.peak(), 3);
}

#[tokio::test(start_paused = true)]
async fn at_most_two_news_topics_refresh_at_once() {
    let slow = ScriptedProvider {
        latency: Duration::from_secs(5),
        ..provider()
    };
    let h = harness(slow, SchedulerConfig::default());
    for id in 1..=5 {
        h.repo.insert_news_topic(news_topic(id, &format!("News {id}"), 1)).expect("news topic");
        h.repo
            .add_news_source(NewNewsSource {
                news_topic_id: id,
                url: format!("https://n{id}.example.com"),
                name: format!("N{id}"),
                is_manual: true,
            })
            .await
            .expect("source");
    }

    let summary = h.scheduler.tick(&CancellationToken::new()).await;
    assert_eq!(summary.news_due, 5);
    assert_eq!(summary.refreshed, 5);
    assert_eq!(h.provider.calls(Purpose::Summarize).len(), 5);
    assert_eq!(h.provider.in_flight.peak(), 2);
}
