use campus_density::clock::{LocalCalendar, SystemClock};
use campus_density::config;
use campus_density::estimation::{Engine, run_scheduler};
use campus_density::feed::FileFeed;
use campus_density::store::{MemoryStore, Repository};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "campus-density", about = "Estimates facility density and wait times")]
struct Args {
    /// Path to the TOML configuration
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Run a single tick and exit
    #[arg(long)]
    once: bool,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "Failed to listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = config::load_from_path(&args.config)?;
    init_tracing(&config.logging.level);

    let tz = config.timezone()?;
    tracing::info!(
        app = %config.app.name,
        config_path = %args.config.display(),
        timezone = %tz,
        "campus-density starting"
    );

    let calendar = LocalCalendar::new(tz);
    let feed = FileFeed::new(config.feed_path(), calendar);
    tracing::info!(path = %feed.path().display(), "Using file feed");

    let engine = Arc::new(Engine::new(
        Repository::new(Arc::new(MemoryStore::new())),
        Arc::new(feed),
        Arc::new(SystemClock),
        calendar,
        config.engine_settings(),
    ));

    if args.once {
        let report = engine.run_tick().await;
        tracing::info!(
            density_failures = report.density.failures(),
            queue_failures = report.queue.failures(),
            "Single tick complete"
        );
        return Ok(());
    }

    let interval = config.interval();
    tracing::info!(interval_secs = interval.as_secs(), "Starting scheduler");
    run_scheduler(engine, interval, shutdown_signal()).await;
    Ok(())
}
