//! Portfolio Stats - visitor analytics backend for a personal portfolio site
//!
//! Serves the portfolio page and its visitor widgets:
//! - One record per visitor IP with provider-chain geolocation
//! - Running totals, top countries and cities
//! - Recent visitor map with live updates over SSE

use anyhow::Result;
use clap::{Parser, Subcommand};
use portfolio_stats::{
    aggregator::StatsAggregator,
    config::{Config, LoggingConfig},
    contact::{ContactService, LogNotifier},
    db::Database,
    events::EventBus,
    feed::StatsFeed,
    geo::GeoLookup,
    retention,
    stats::StatsReader,
    web,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "portfolio-stats", about = "Visitor analytics for a portfolio site")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the web server (default)
    Serve,
    /// Clear the running totals; visitor records are kept
    ResetStats,
    /// Recompute the running totals from stored visitor records
    RebuildStats,
    /// Delete visitor records outside the retention window once and exit
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    init_logging(&config.logging);
    info!("Configuration loaded");

    let db = Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!("Database initialized");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, db).await,
        Command::ResetStats => {
            db.reset_stats().await?;
            info!("Visitor stats reset");
            Ok(())
        }
        Command::RebuildStats => {
            let stats = db.rebuild_stats().await?;
            info!(
                total_visitors = stats.total_visitors,
                countries = stats.countries.len(),
                cities = stats.cities.len(),
                "Visitor stats rebuilt"
            );
            Ok(())
        }
        Command::Prune => {
            let deleted = retention::run_retention_once(&db, config.retention.days).await?;
            info!(deleted, retention_days = config.retention.days, "Prune complete");
            Ok(())
        }
    }
}

/// `logging.format = "gcp"` switches to structured GCP Cloud Logging.
/// RUST_LOG, when set, overrides the configured level.
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn serve(config: Config, db: Database) -> Result<()> {
    info!("Starting Portfolio Stats...");

    // Both reqwest and axum-server link rustls; pick one provider for the process
    let _ = rustls::crypto::ring::default_provider().install_default();

    let geo = Arc::new(GeoLookup::from_config(&config.geo)?);
    if geo.provider_count() == 0 {
        tracing::warn!("No geolocation provider available, every visit resolves to Unknown");
    }

    let event_bus = EventBus::with_capacity(1000);
    let aggregator = StatsAggregator::new(db.clone(), geo, event_bus.clone());

    let reader = Arc::new(StatsReader::new(db.clone(), config.stats.top_n));
    let feed = StatsFeed::start(reader, Duration::from_secs(config.stats.refresh_interval_secs)).await;

    let notifier = Arc::new(LogNotifier::new(&config.contact.recipient));
    let contact = ContactService::new(db.clone(), notifier);

    let retention_task = retention::start_retention_task(
        db.clone(),
        config.retention.days,
        config.retention.interval_secs,
    );
    info!(retention_days = config.retention.days, "Retention task started");

    let state = Arc::new(web::AppState {
        aggregator,
        feed,
        contact,
        event_bus,
    });

    let result = web::start_server(&config, state).await;
    retention_task.abort();
    result
}
