use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use feedvault::config::Config;
use feedvault::feed::FeedFetcher;
use feedvault::storage::{Database, DatabaseError};
use feedvault::update::{FeedUpdater, OutcomeSink, UpdateScheduler, UpdateSummary};
use feedvault::util::{validate_feed_url, Blocklist};

#[derive(Parser, Debug)]
#[command(name = "feedvault", about = "Archive RSS, Atom and JSON feeds into SQLite", version)]
struct Args {
    /// Configuration file
    #[arg(long, value_name = "FILE", default_value = "feedvault.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a feed; it is fetched on the next update
    Add { url: String },
    /// Run one update cycle over all due feeds, or force one feed
    Update {
        /// Refresh only this feed, ignoring validators and the staleness window
        #[arg(long)]
        url: Option<String>,
    },
    /// Run update cycles until interrupted
    Watch,
    /// Re-enable updates for a feed (also clears its broken flag)
    Enable { url: String },
    /// Stop updating a feed
    Disable { url: String },
}

fn init_tracing(config: &Config) {
    // RUST_LOG wins; the configured level is the fallback
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_database(path: &Path) -> Result<Database> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            anyhow::bail!(
                "Database '{}' is locked by another feedvault process. Stop it and try again.",
                path.display()
            )
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

fn build_updater(config: &Config, db: &Database) -> Result<Arc<FeedUpdater>> {
    let client = FeedFetcher::build_client(&config.user_agent, config.fetch_timeout())
        .context("Failed to build HTTP client")?;
    let fetcher = FeedFetcher::new(client, config.fetch_timeout(), config.max_feed_size_bytes);
    Ok(Arc::new(FeedUpdater::new(
        Arc::new(db.clone()),
        fetcher,
        config.staleness_window(),
    )))
}

/// Cancel on Ctrl-C; units already running finish their feed
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing in-flight feeds");
            token.cancel();
        }
    });
    cancel
}

async fn run(config: Config, command: Command, db: &Database) -> Result<()> {
    match command {
        Command::Add { url } => {
            let blocklist = match &config.blocklist_path {
                Some(path) => Blocklist::load(path).with_context(|| {
                    format!("Failed to read blocklist '{}'", path.display())
                })?,
                None => Blocklist::default(),
            };
            let url = validate_feed_url(&url, &blocklist)
                .with_context(|| format!("Refusing to add '{}'", url))?;
            let feed = db
                .add_feed(url.as_str(), Utc::now())
                .await
                .context("Failed to add feed")?;
            tracing::info!(feed = %feed.url, "Feed added");
            println!("Added {}", feed.url);
        }
        Command::Update { url: Some(url) } => {
            db.set_feed_stale(&url, true)
                .await
                .with_context(|| format!("Failed to mark '{}' for refresh", url))?;
            let updater = build_updater(&config, db)?;
            let sink = OutcomeSink::new(Some(config.broken_feeds_path.clone()));
            let report = updater.update_url(&url, Utc::now()).await;
            sink.record(&report).await;
            let mut summary = UpdateSummary::default();
            summary.record(&report);
            sink.record_summary(&summary);
            println!("{}", report);
        }
        Command::Update { url: None } => {
            let scheduler = UpdateScheduler::new(
                build_updater(&config, db)?,
                Arc::new(OutcomeSink::new(Some(config.broken_feeds_path.clone()))),
                config.max_concurrent_updates,
            );
            let summary = scheduler
                .run_cycle(&cancel_on_ctrl_c())
                .await
                .context("Failed to select feeds for update")?;
            println!("{}", summary);
        }
        Command::Watch => {
            let scheduler = UpdateScheduler::new(
                build_updater(&config, db)?,
                Arc::new(OutcomeSink::new(Some(config.broken_feeds_path.clone()))),
                config.max_concurrent_updates,
            );
            tracing::info!(
                interval_minutes = config.update_interval_minutes,
                "Watching feeds"
            );
            scheduler
                .run_forever(config.update_interval(), cancel_on_ctrl_c())
                .await;
        }
        Command::Enable { url } => {
            db.set_feed_enabled(&url, true)
                .await
                .with_context(|| format!("Failed to enable '{}'", url))?;
            println!("Enabled {}", url);
        }
        Command::Disable { url } => {
            db.set_feed_enabled(&url, false)
                .await
                .with_context(|| format!("Failed to disable '{}'", url))?;
            println!("Disabled {}", url);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config '{}'", args.config.display()))?;
    init_tracing(&config);
    tracing::debug!(?config, "Configuration loaded");

    let db = open_database(&config.database_path).await?;
    let result = run(config, args.command, &db).await;

    // Close exactly once, whether or not the command succeeded
    db.close().await;
    result
}
