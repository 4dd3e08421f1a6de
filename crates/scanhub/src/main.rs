mod api;
mod config;
mod db;
mod gmp;
mod manager;
mod metrics;
mod models;
mod report;
mod scheduler;
mod selector;
mod sync;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::config::{AppConfig, LoggingConfig};
use crate::db::Store;
use crate::gmp::ProbeSet;
use crate::manager::ScanManager;
use crate::metrics::Metrics;
use crate::scheduler::Scheduler;
use crate::sync::TargetSync;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub manager: Arc<ScanManager>,
    pub probes: Arc<ProbeSet>,
    pub metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(AppConfig::load()?);
    init_tracing(&config.logging);

    let store = Store::open(&config.scan.db_path).await?;
    let metrics = Arc::new(Metrics::new());
    let probes = Arc::new(ProbeSet::from_config(&config));
    let manager = Arc::new(ScanManager::new(
        store.clone(),
        probes.clone(),
        config.clone(),
        metrics.clone(),
    )?);

    manager.recover().await?;

    if config.source.url.is_some() {
        let target_sync = TargetSync::new(store.clone(), config.source.clone())?;
        tokio::spawn(target_sync.run_loop());
        let scheduler = Scheduler::new(
            store.clone(),
            manager.clone(),
            config.source.scheduler_interval,
        );
        tokio::spawn(scheduler.run_loop());
    } else {
        info!("source.url not configured; target sync and scheduler disabled");
    }

    let state = AppState {
        store,
        manager,
        probes,
        metrics,
    };
    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(60)));

    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .context("invalid api host/port")?;
    info!(%addr, probes = config.probes.len(), "scanhub listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received; unfinished scans resume on next start");
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));
    if cfg.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
