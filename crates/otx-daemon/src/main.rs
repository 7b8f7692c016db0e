//! otx-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads configuration,
//! builds the shared state, wires middleware, and starts the HTTP server.
//! All route handlers live in `routes.rs`; all shared state types live in
//! `state.rs`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::Method;
use otx_daemon::{routes, state};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let settings = Arc::new(otx_config::Settings::load_from_env()?);
    info!(fingerprint = %settings.fingerprint(), "resolved configuration");

    let pool = otx_db::connect_from_env().await.context("connecting to database")?;
    otx_db::migrate(&pool).await.context("running migrations")?;
    let store: Arc<dyn otx_db::Store> = Arc::new(otx_db::PgStore::new(pool));

    let pool_manager = Arc::new(otx_pool::PoolManager::new(store.clone(), Some(settings.store_call_deadline)));
    let reclaimed = pool_manager
        .sweep_stuck_allocations(settings.janitor_stuck_threshold)
        .await
        .context("startup allocation sweep")?;
    info!(reclaimed, "startup allocation sweep complete");
    otx_pool::spawn_janitor(
        pool_manager.clone(),
        settings.janitor_interval,
        settings.janitor_stuck_threshold,
    );

    let broadcaster: Arc<dyn otx_broadcast::BroadcastClient> = Arc::new(
        otx_broadcast::HttpBroadcastClient::new(settings.broadcast_url.clone(), settings.broadcast_timeout),
    );

    let scheduler_config = otx_scheduler::SchedulerConfig {
        channel_capacity: settings.scheduler_channel_capacity,
        tick: settings.scheduler_tick,
        max_batch: settings.scheduler_max_batch,
        drain_deadline: settings.scheduler_drain_deadline,
        store_call_deadline: Some(settings.store_call_deadline),
    };
    let (scheduler_handle, scheduler_shutdown, scheduler_join) =
        otx_scheduler::spawn(scheduler_config, broadcaster, store.clone());

    let builder: Arc<dyn otx_builder::TransactionBuilder> = Arc::new(otx_builder::StubBuilder::new());

    let shared = Arc::new(state::AppState::new(
        store,
        pool_manager,
        builder,
        scheduler_handle,
        settings.clone(),
    ));

    let app = routes::build_router(shared.clone())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(permissive_cors());

    let addr: SocketAddr = settings.bind_addr.parse().context("parsing bind address")?;
    info!("otx-daemon listening on http://{}", addr);

    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server crashed")?;

    info!("intake closed, draining scheduler");
    let _ = scheduler_shutdown.send(true);
    if tokio::time::timeout(Duration::from_secs(60), scheduler_join).await.is_err() {
        tracing::warn!("scheduler did not drain within the shutdown grace period");
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn permissive_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH])
        .allow_headers(Any)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
