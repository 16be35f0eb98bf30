//! `kibble` binary: runs the refresh scheduler or one refresh step at a time.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kibble_adapters::{CandidateValidator, SourceScraper};
use kibble_storage::{MemoryRepository, MemorySeed, PgRepository, Repository};
use kibble_sync::{Collaborators, Scheduler, SchedulerConfig};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "kibble")]
#[command(about = "Kibble refresh core: facts generation and news summarization")]
struct Cli {
    /// YAML file overriding the environment configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the periodic scheduler until interrupted.
    Run,
    /// Refresh one facts topic now.
    Refresh { topic_id: i64 },
    /// Refresh one news topic now.
    RefreshNews { news_topic_id: i64 },
    /// Replace a news topic's discovered sources.
    Discover { news_topic_id: i64 },
    /// Check whether a URL would be accepted as a news source.
    Validate {
        url: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Extract content from one URL and print it.
    Extract {
        url: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = SchedulerConfig::from_env();
    if let Some(path) = &cli.config {
        config = config.with_yaml_file(path)?;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let repo = open_repository(&config).await?;
            let scheduler = Scheduler::from_config(config, repo)?;
            scheduler.run(shutdown_token()).await;
        }
        Commands::Refresh { topic_id } => {
            let repo = open_repository(&config).await?;
            let scheduler = Scheduler::from_config(config, repo)?;
            let report = scheduler.refresh_now(topic_id, &shutdown_token()).await?;
            print_json(&report)?;
        }
        Commands::RefreshNews { news_topic_id } => {
            let repo = open_repository(&config).await?;
            let scheduler = Scheduler::from_config(config, repo)?;
            let Some(report) = scheduler.refresh_news_now(news_topic_id, &shutdown_token()).await else {
                bail!("news topic {news_topic_id} was not refreshed: busy or missing");
            };
            print_json(&report)?;
            if let Some(kind) = report.error_kind {
                bail!("news refresh failed ({kind})");
            }
        }
        Commands::Discover { news_topic_id } => {
            let repo = open_repository(&config).await?;
            let scheduler = Scheduler::from_config(config, repo)?;
            let report = scheduler.discover_sources_now(news_topic_id, &shutdown_token()).await?;
            print_json(&report)?;
        }
        Commands::Validate { url, name } => {
            let collab = Collaborators::live(&config, Arc::new(MemoryRepository::new()))?;
            let outcome = collab.validator.validate(&url, &name).await;
            print_json(&outcome)?;
        }
        Commands::Extract { url, name } => {
            let collab = Collaborators::live(&config, Arc::new(MemoryRepository::new()))?;
            let content = collab.scraper.scrape(&url, &name).await?;
            print_json(&content)?;
        }
        Commands::Migrate => {
            let repo = PgRepository::connect(&config.database_url).await?;
            repo.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

/// `RUST_LOG` wins; `KIBBLE_LOG_JSON=1` switches to one JSON object per line.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,kibble=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("KIBBLE_LOG_JSON").is_ok_and(|v| v == "1") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

/// In-memory repository from the seed file when one is configured, Postgres otherwise.
async fn open_repository(config: &SchedulerConfig) -> Result<Arc<dyn Repository>> {
    match &config.seed_path {
        Some(path) => {
            let seed = MemorySeed::from_yaml_file(path)?;
            info!(
                seed = %path.display(),
                topics = seed.topics.len(),
                news_topics = seed.news_topics.len(),
                "using in-memory repository"
            );
            Ok(Arc::new(MemoryRepository::from_seed(seed)))
        }
        None => {
            let repo = PgRepository::connect(&config.database_url)
                .await
                .context("opening postgres repository")?;
            Ok(Arc::new(repo))
        }
    }
}

/// Cancelled on Ctrl-C so in-flight refreshes can wind down.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                trigger.cancel();
            }
            Err(err) => warn!(error = %err, "failed to listen for interrupt"),
        }
    });
    cancel
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_runs_the_scheduler() {
        let cli = Cli::try_parse_from(["kibble"]).expect("parses");
        assert!(cli.command.is_none());
    }

    #[test]
    fn subcommands_take_ids_and_urls() {
        let cli = Cli::try_parse_from(["kibble", "refresh-news", "7", "--config", "kibble.yaml"]).expect("parses");
        assert!(matches!(cli.command, Some(Commands::RefreshNews { news_topic_id: 7 })));
        assert_eq!(cli.config, Some(PathBuf::from("kibble.yaml")));

        let cli = Cli::try_parse_from(["kibble", "validate", "https://example.org/feed", "--name", "Example"])
            .expect("parses");
        match cli.command {
            Some(Commands::Validate { url, name }) => {
                assert_eq!(url, "https://example.org/feed");
                assert_eq!(name, "Example");
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from(["kibble", "refresh", "not-a-number"]).is_err());
    }
}
