mod error;
mod routes;
mod state;

use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use timemachine_core::config::{BackendMode, ConfigLoader};
use timemachine_core::daemon::ShutdownCoordinator;
use timemachine_core::schedule::{self, ScheduleEngine, ScheduleStore};
use timemachine_core::utils;
use timemachine_core::watcher::ChangeWatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loader = ConfigLoader::from_args(None);
    let settings = loader.load()?;

    // Initialize logging
    utils::logger::init(&settings.log.level)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = settings.server.port,
        mode = ?settings.backup.mode,
        "Starting time machine server"
    );

    // Ensure data directories exist
    std::fs::create_dir_all(&settings.server.data_dir)?;

    // Initialize cron scheduler
    let store = ScheduleStore::new(settings.schedule_file());
    let engine = Arc::new(ScheduleEngine::new(store, schedule::snapshot_trigger(loader.clone())).await?);
    if let Err(e) = engine.load_all().await {
        tracing::warn!("Failed to initialize schedules: {}", e);
    }
    if let Err(e) = engine.start().await {
        tracing::warn!("Failed to start scheduler: {}", e);
    }

    // Change watcher (history mode only)
    let watcher = if settings.watch.enabled && settings.backup.mode == BackendMode::History {
        match ChangeWatcher::start(&settings) {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!("Failed to start change watcher: {}", e);
                None
            }
        }
    } else {
        if settings.watch.enabled {
            tracing::info!("Change watcher requires history mode; not started");
        }
        None
    };

    let state = Arc::new(AppState::new(loader, engine.clone()));
    let app = routes::create_router(state);

    // Start HTTP server
    let addr = format!("0.0.0.0:{}", settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let shutdown = ShutdownCoordinator::new();
    let server_token = shutdown.token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_token.cancelled_owned())
            .await
    });

    shutdown.wait_for_signal().await;

    // Cleanup
    tracing::info!("Shutting down...");
    match tokio::time::timeout(Duration::from_secs(10), server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!("HTTP server error: {}", e),
        Ok(Err(e)) => tracing::warn!("HTTP server task failed: {}", e),
        Err(_) => tracing::warn!("HTTP server did not stop within 10s"),
    }

    if let Some(mut watcher) = watcher {
        watcher.stop().await;
    }

    if let Err(e) = engine.shutdown().await {
        tracing::warn!("Scheduler shutdown error: {}", e);
    }

    tracing::info!("Server stopped");
    Ok(())
}
