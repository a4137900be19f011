mod bootstrap;
mod health;
mod routes;

use std::time::Duration;

use anyhow::Result;
use concierge_core::config::{AppConfig, LoadOptions};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::health::HealthState;
use crate::routes::AppState;

fn init_logging(config: &AppConfig) {
    use concierge_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging must exist before bootstrap so its failures are visible.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let mut app = bootstrap::bootstrap_with_config(config).await?;

    let mut state = AppState::new(app.runtime.clone(), app.replies.clone());
    if let Some(history) = app.history.clone() {
        state = state.with_history(history);
    }
    let fire_loop = app.fires.take().map(|fires| routes::spawn_fire_loop(state.clone(), fires));

    let router = routes::router(state)
        .merge(health::router(HealthState::new(app.db_pool.clone(), app.ontology.clone())));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        session_id = "unknown",
        bind_address = %address,
        "concierge-server listening"
    );

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        session_id = "unknown",
        "concierge-server stopping; draining in-flight turns"
    );
    let _ = stop_tx.send(());

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(error))) => {
            tracing::error!(
                event_name = "system.server.error",
                correlation_id = "shutdown",
                session_id = "unknown",
                error = %error,
                "server terminated with an error"
            );
        }
        Ok(Err(error)) => {
            tracing::error!(
                event_name = "system.server.error",
                correlation_id = "shutdown",
                session_id = "unknown",
                error = %error,
                "server task panicked"
            );
        }
        Err(_) => {
            tracing::warn!(
                event_name = "system.server.drain_timeout",
                correlation_id = "shutdown",
                session_id = "unknown",
                grace_secs = grace.as_secs(),
                "in-flight requests did not finish within the shutdown window"
            );
        }
    }

    if let Some(fire_loop) = fire_loop {
        fire_loop.abort();
    }
    app.db_pool.close().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
