use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppConfig;
use crate::db::SqliteRepo;
use crate::web;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub repo: SqliteRepo,
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load().await?;
    info!(
        bind_addr = %config.bind_addr,
        db_engine = %config.db_engine,
        db_path = %config.db_path,
        static_dir = %config.static_dir,
        "config loaded"
    );

    let repo = SqliteRepo::new(&config.db_path);
    repo.ensure_schema().await.context("prepare database schema")?;

    let state = AppState {
        config: config.clone(),
        repo,
    };
    let app = build_router(state, &config);

    let addr: std::net::SocketAddr = config.bind_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub(crate) fn build_router(state: AppState, config: &AppConfig) -> Router {
    web::router(state)
        .layer(axum::middleware::from_fn(web::cors))
        .layer(RequestBodyLimitLayer::new(
            usize::try_from(config.max_body_bytes).unwrap_or(usize::MAX),
        ))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.request_timeout_seconds.max(1) as u64,
        )))
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
