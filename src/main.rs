use std::{error::Error, sync::Arc};

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use minefund::{
    api::{self, AppState},
    config::{CliArgs, Command, Config, LoggingConfig, StorageKind},
    fees::{FeeInput, FeeService},
    live::LiveCache,
    storage::{InMemoryStorage, StorageBackend},
};
use minefund_sqlite::SqliteStorage;

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));
    if config.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn open_storage(config: &Config) -> Result<Arc<dyn StorageBackend>, Box<dyn Error>> {
    Ok(match config.storage.backend {
        StorageKind::Memory => Arc::new(InMemoryStorage::new()),
        StorageKind::Sqlite => Arc::new(SqliteStorage::new(&config.storage.path)?),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = CliArgs::parse();
    let config = Config::load(&cli)?;
    init_logging(&config.logging);

    match cli.command.clone().unwrap_or(Command::Serve) {
        Command::FeePreview { amount, percentage_rate, flat_fee } => {
            // Previews never touch persistent storage.
            let fees = FeeService::new(Arc::new(InMemoryStorage::new()));
            let preview = fees.preview(&FeeInput::new(amount, percentage_rate, flat_fee))?;
            println!("{}", preview.breakdown);
            if let Some(warning) = preview.warning {
                println!("Warning: {}", warning);
            }
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: Config) -> Result<(), Box<dyn Error>> {
    let storage = open_storage(&config)?;
    tracing::info!(backend = ?config.storage.backend, "Storage ready");

    let live = Arc::new(LiveCache::new());
    live.spawn(storage.clone())?;

    let metrics = PrometheusBuilder::new().install_recorder()?;
    let state = AppState::new(storage, live, &config).with_metrics(metrics);
    let app = api::router(Arc::new(state), Arc::new(config.auth.clone()));

    let addr = config.listen_addr()?;
    tracing::info!(%addr, auth = config.auth.enabled, "API listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
