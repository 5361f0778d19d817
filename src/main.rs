use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use envbook::auth::StaticTokenStore;
use envbook::config::Config;
use envbook::engine::Engine;
use envbook::http::{self, AppState};
use envbook::service::ReservationService;
use envbook::{compactor, observability, provision};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(Engine::new(config.wal_path())?);

    if let Some(path) = &config.environments_file {
        let seeds = provision::load_seeds(path)?;
        let created = provision::apply_seeds(&engine, seeds).await?;
        info!("provisioned {created} new environments from {}", path.display());
    }

    let tokens = match &config.tokens_file {
        Some(path) => StaticTokenStore::from_file(path)?,
        None => StaticTokenStore::default(),
    };
    if tokens.is_empty() {
        tracing::warn!("no bearer tokens configured; every API request will be rejected");
    }

    let compactor_engine = engine.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        compactor::run_compactor(compactor_engine, threshold).await;
    });

    let state = AppState::new(ReservationService::new(engine.clone()), Arc::new(tokens));
    let app = http::router(state, config.max_connections);

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("envbook listening on {}", config.bind_addr);
    info!("  data_dir: {}", config.data_dir.display());
    info!("  environments: {}", engine.environment_count());
    info!("  max_connections: {}", config.max_connections);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped, compacting WAL");
    if let Err(e) = engine.compact_wal().await {
        tracing::error!("final compaction failed: {e}");
    }
    info!("envbook stopped");
    Ok(())
}

/// Resolves on SIGTERM or ctrl-c.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("unable to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("unable to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining requests");
}
