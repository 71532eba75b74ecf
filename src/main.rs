use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use mcapi::api::{self, AppState};
use mcapi::checker::NetworkDispatcher;
use mcapi::config::Config;
use mcapi::engine::Orchestrator;
use mcapi::report::{self, LogReporter, Reporter};
use mcapi::store::{self, StatusCache};
use mcapi::telemetry;

#[derive(Debug, Parser)]
#[command(name = "mcapi", version, about = "Cached status API for game servers")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Write a configuration file with sane defaults and exit
    #[arg(long)]
    gencfg: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.gencfg {
        telemetry::init_logging("")?;
        Config::write_default(&cli.config)?;
        info!("Saved configuration file with sane defaults, please update as needed");
        return Ok(());
    }

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            telemetry::init_logging("")?;
            LogReporter.report("loading configuration", &e);
            return Err(e);
        }
    };

    telemetry::init_logging(&config.log_file)?;
    let reporter = report::from_endpoint(config.report_url.as_deref());

    let index_html = std::fs::read_to_string(&config.template_file)
        .with_context(|| format!("Failed to read template {}", config.template_file))?;

    let store = store::connect(&config.store_url)
        .await
        .with_context(|| format!("Failed to connect to store at {}", config.store_url))?;
    let cache = StatusCache::new(store);

    let dispatcher = Arc::new(NetworkDispatcher::new(&config, cache.clone(), reporter.clone()));
    info!("Checks limited to {} in flight", dispatcher.available_permits());

    let orchestrator = Arc::new(Orchestrator::new(
        cache.clone(),
        dispatcher,
        reporter.clone(),
        config.refresh_interval(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresh_handle = tokio::spawn(orchestrator.run(shutdown_rx));

    let state = AppState {
        cache,
        reporter,
        index_html: index_html.into(),
    };
    let app = api::create_router(state, &config.static_files, config.cache_max_age_secs);

    api::start_server(config.bind_addr()?, app, async {
        let _ = signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    let _ = refresh_handle.await;
    info!("Stopped");

    Ok(())
}
