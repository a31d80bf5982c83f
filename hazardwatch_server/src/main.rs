//! HazardWatch Server - HTTP surface of the corroboration engine
//!
//! Accepts citizen hazard reports, clusters and verifies them, and serves the
//! verified map feed:
//! - `POST /report` ingest one report
//! - `GET /hazards` verified hazards, optionally near a point
//! - `GET /clusters/{id}` status of any cluster
//! - `GET /health` liveness

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hazardwatch_core::{HazardEngine, HazardStore, MemoryStore, SledStore};
use hazardwatch_env::{HazardContext, TokioContext};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod routes;

use config::Args;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("hazardwatch_core=info".parse()?)
                .add_directive("hazardwatch_server=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = args.engine_config()?;

    let store: Arc<dyn HazardStore> = match &args.data_dir {
        Some(dir) => {
            info!(path = %dir.display(), "Opening sled store");
            Arc::new(
                SledStore::open(dir)
                    .with_context(|| format!("failed to open store at {}", dir.display()))?,
            )
        }
        None => {
            info!("No data dir given, clusters are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let ctx = TokioContext::shared();
    let engine = Arc::new(
        HazardEngine::new(Arc::clone(&ctx), store, config).context("failed to start engine")?,
    );

    ctx.spawn(
        "expiry-sweeper",
        Arc::clone(&engine).run_sweeper(args.sweep_interval()),
    );

    let app = routes::build_router(engine);

    info!(addr = %args.bind, "HazardWatch server listening");
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    axum::serve(listener, app).await?;

    Ok(())
}
