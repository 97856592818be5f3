use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::rest::{self, AppState};
use crate::config::{DaemonConfig, FeedConfig};
use crate::domain::events::{EventBuffer, EventSink, Notifier};
use crate::domain::reconcile::{Engine, FeedContext};
use crate::domain::registry::Registry;

pub async fn run(config: DaemonConfig, feeds: Vec<FeedConfig>) -> Result<()> {
    // Init tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "meshmon daemon starting");

    let db_path = config.database_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let registry = Arc::new(Registry::open(&db_path)?);
    info!(db = %db_path.display(), "registry opened");

    let events = Arc::new(EventBuffer::new(config.event_buffer));
    let engine = Arc::new(Engine::new(
        registry.clone(),
        Notifier::new(config.map_uri.clone()),
        events.clone() as Arc<dyn EventSink>,
        Duration::from_secs(config.fetch_timeout_secs),
        &config.skip_nodes,
        &config.ignore_fields,
    )?);

    if feeds.is_empty() {
        warn!("no feeds configured, registry will not be updated");
    }

    // One reconciliation loop per feed. The first tick fires immediately
    // and is the silent bootstrap cycle.
    let mut poll_tasks = Vec::new();
    for feed in feeds {
        let engine = engine.clone();
        let interval_secs = config.poll_interval_secs;
        poll_tasks.push(tokio::spawn(async move {
            let mut ctx = FeedContext::new(feed);
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                engine.tick(&mut ctx).await;
            }
        }));
    }

    let app = rest::router(AppState {
        registry: registry.clone(),
        events,
    })
    .layer(TraceLayer::new_for_http());

    let http_addr = &config.http_addr;
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding to {}", http_addr))?;

    info!(addr = %http_addr, "HTTP server listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // Stop the poll loops before the shutdown sweep; a tick committing
    // after the sweep would re-mark its nodes online.
    for task in poll_tasks {
        task.abort();
        let _ = task.await;
    }

    // Presence is only trustworthy while the poll loops run; a restart
    // must not diff against stale online flags.
    registry.mark_all_offline()?;

    info!("meshmon daemon stopped");
    Ok(())
}


async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, shutting down"); },
        _ = terminate => { info!("Received SIGTERM, shutting down"); },
    }
}
