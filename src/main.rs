use anyhow::{Context, Result};
use gridwell_dlm::allocator::Allocator;
use gridwell_dlm::capability::CapabilityRegistry;
use gridwell_dlm::config::Config;
use gridwell_dlm::constraints::ConstraintsEvaluator;
use gridwell_dlm::failsafe::FailSafeManager;
use gridwell_dlm::logging::{self, get_logger};
use gridwell_dlm::persistence::PersistenceManager;
use gridwell_dlm::session::SessionManager;
use gridwell_dlm::shedding::SheddingController;
use gridwell_dlm::state::StateStore;
use gridwell_dlm::web::{self, AppState};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    logging::init_logging(&config.logging).context("failed to initialize logging")?;
    let logger = get_logger("main");

    info!("Gridwell DLM control plane starting up");

    let mut persistence = PersistenceManager::new(config.persistence_path.clone());
    persistence
        .load()
        .context("failed to load persisted state")?;

    let store = StateStore::new(
        persistence.document().constraints.clone(),
        persistence.document().zones.clone(),
    );
    store.restore(persistence.document()).await;

    let capabilities = Arc::new(CapabilityRegistry::new());
    let constraints = Arc::new(ConstraintsEvaluator::new());
    let shedding = Arc::new(SheddingController::new(
        config.shedding.upper_threshold,
        config.shedding.lower_threshold,
        config.shedding.smoothing_window,
        config.shedding.min_update_interval_ms,
    ));
    let allocator = Arc::new(Allocator::new(
        store.clone(),
        capabilities.clone(),
        constraints.clone(),
        shedding.clone(),
        config.grid.clone(),
        config.allocator.clone(),
    ));
    let failsafe = Arc::new(FailSafeManager::new(
        store.clone(),
        config.failsafe.heartbeat_interval_ms,
        config.failsafe.heartbeat_timeout_ms,
    ));
    let sessions = Arc::new(AsyncMutex::new(SessionManager::new(
        100,
        config.grid.energy_cost_per_kwh,
    )));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let allocator_task = {
        let allocator = allocator.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { allocator.run(rx).await })
    };

    let failsafe_task = {
        let failsafe = failsafe.clone();
        let rx = shutdown_rx.clone();
        let enabled = config.failsafe.enabled;
        tokio::spawn(async move {
            if enabled {
                failsafe.run(rx).await;
            }
        })
    };

    let web_task = {
        let app_state = AppState {
            store: store.clone(),
            capabilities: capabilities.clone(),
            constraints: constraints.clone(),
            shedding: shedding.clone(),
            allocator: allocator.clone(),
            failsafe: failsafe.clone(),
            sessions: sessions.clone(),
            config: Arc::new(config.clone()),
        };
        let addr = format!("{}:{}", config.web.host, config.web.port);
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!("failed to bind web server on {addr}: {e}");
                    return;
                }
            };
            info!("web API listening on {addr}");
            let router = web::router(app_state);
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await
                .ok();
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, draining control loops");

    let _ = shutdown_tx.send(true);

    let _ = allocator_task.await;
    let _ = failsafe_task.await;
    let _ = web_task.await;

    let document = store.to_document().await;
    persistence.set_document(document);
    persistence
        .save()
        .context("failed to persist state on shutdown")?;

    logger.info("gridwell-dlm shut down cleanly");
    Ok(())
}
