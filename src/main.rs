//! netpulse - active synthetic-monitoring engine.

mod alert;
mod config;
mod db;
mod logsink;
mod probe;
mod resolver;
mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use alert::AlertEngine;
use config::Config;
use db::Store;
use logsink::{FileSink, IndexClient, IndexSink};
use scheduler::{Engine, Pipeline};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("netpulse=info".parse()?),
        )
        .init();

    let cfg = Config::load();
    tracing::info!(db_path = %cfg.db_path, workers = cfg.workers, "starting netpulse");

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("database initialized");

    let file_sink = FileSink::spawn(&cfg.log_dir, cfg.sink_capacity);
    let index_sink = cfg.index.clone().map(|index_cfg| {
        tracing::info!(url = %index_cfg.url, prefix = %index_cfg.prefix, "index sink enabled");
        IndexSink::spawn(IndexClient::new(index_cfg), cfg.sink_capacity)
    });

    let alert = Arc::new(AlertEngine::new(store.clone()));
    let pipeline = Pipeline::new(store.clone(), alert, file_sink, index_sink);

    let engine = Engine::new(
        store,
        pipeline,
        cfg.workers,
        cfg.queue_capacity,
        Duration::from_secs(cfg.probe_timeout_secs),
    );
    engine.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    engine.shutdown();

    // Give workers and sinks a moment to drain.
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}
