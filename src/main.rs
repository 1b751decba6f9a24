//! FactFeed Engine
//!
//! Personalized fact feed service.
//!
//! # Architecture
//!
//! - **Store**: in-memory or PostgreSQL-backed partitioned key-value store
//! - **Ledger & Metrics**: interaction recording and popularity maintenance
//! - **Ranking Engine**: personalized, similar and trending fact ordering
//! - **API Server**: REST endpoints for the mobile client
//!
//! # Graceful Shutdown
//!
//! The engine handles SIGTERM and SIGINT signals, ensuring:
//! - In-flight requests complete
//! - Database connections are closed cleanly

use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use factfeed::api::{self, AppState};
use factfeed::config::{Config, StoreBackend};
use factfeed::database::Database;
use factfeed::facts::NewFact;
use factfeed::store::{MemoryStore, PartitionedStore};
use factfeed::DataAccess;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with structured logging
    init_tracing();

    info!("FactFeed Engine v{} starting", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env().context("failed to load configuration")?;
    info!("Configuration loaded and validated");

    #[cfg(feature = "metrics")]
    {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .install()
            .context("failed to install Prometheus exporter")?;
        info!("Prometheus exporter installed");
    }

    // Select the store backend
    let (store, db): (Arc<dyn PartitionedStore>, Option<Database>) = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; data is lost on restart");
            (Arc::new(MemoryStore::new()), None)
        }
        StoreBackend::Postgres => {
            let db = Database::connect(&config.store.database)
                .await
                .context("failed to open the PostgreSQL store")?;
            (Arc::new(db.store()), Some(db))
        }
    };

    let access = DataAccess::new(store, config.retry.clone());
    let state = Arc::new(AppState::new(access, &config, db.clone()));

    if let Some(path) = &config.seed_facts_file {
        seed_facts(&state, path).await?;
    }

    info!(
        "API: http://{}:{} (health: /health)",
        config.api.host, config.api.port
    );
    api::start_server(state, &config.api, shutdown_signal())
        .await
        .context("API server failed")?;

    // Cleanup resources
    if let Some(db) = db {
        db.close().await;
    }

    info!("FactFeed Engine stopped gracefully");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default log levels
        EnvFilter::new("factfeed=debug,tower_http=debug,sqlx=warn,info")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(std::env::var("NO_COLOR").is_err()),
            )
            .init();
    }
}

/// Import a JSON array of facts
async fn seed_facts(state: &AppState, path: &str) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read seed file {}", path))?;
    let facts: Vec<NewFact> =
        serde_json::from_str(&raw).with_context(|| format!("invalid seed file {}", path))?;
    let imported = state.facts.import(facts).await?;
    info!("Seeded {} facts from {}", imported.len(), path);
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
