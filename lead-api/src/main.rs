use std::sync::Arc;

use axum::Router;
use config::{Config, StorageBackend};
use envconfig::Envconfig;
use eyre::Result;
use tracing_subscriber::EnvFilter;

use lead_common::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use lead_common::pipeline::LeadPipeline;
use lead_common::store::{LeadStore, MemoryStore, PgStore};

mod config;
mod handlers;

async fn build_store(config: &Config) -> Result<Arc<dyn LeadStore>> {
    let store: Arc<dyn LeadStore> = match config.storage {
        StorageBackend::Postgres => {
            let store = PgStore::new(&config.database_url, config.max_pg_connections).await?;
            store.migrate().await?;
            Arc::new(store)
        }
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage, nothing will be persisted");
            Arc::new(MemoryStore::new())
        }
    };

    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = build_store(&config).await?;
    let pipeline = LeadPipeline::new(store, config.pipeline_settings())?;

    let recorder_handle = setup_metrics_recorder()
        .map_err(|e| eyre::eyre!("failed to install metrics recorder: {}", e))?;
    let app = handlers::add_routes(
        Router::new(),
        pipeline,
        config.max_body_size,
        config.concurrency_limit,
    );
    let app = setup_metrics_routes(app, recorder_handle);

    let bind = config.bind();
    tracing::info!("lead-api listening on {}", bind);
    if let Err(e) = serve(app, &bind).await {
        tracing::error!("failed to start lead-api http server, {}", e);
        return Err(e.into());
    }

    Ok(())
}
