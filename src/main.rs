//! Stratum mining server core — process entry point.
//!
//! Wiring grounded on the teacher's `main.rs`: `Config::load()` ->
//! construct collaborators -> spawn the background pollers -> serve an
//! axum HTTP API alongside the Stratum TCP listener -> combined
//! `ctrl_c()`/`SIGTERM` graceful shutdown, fed to both servers.

use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use stratum_pool_core::config::Config;
use stratum_pool_core::jobs::TemplatePoller;
use stratum_pool_core::shares::AcceptAllAlgorithm;
use stratum_pool_core::store::{Cache, CoinRpcClient, PersistentStore};
use stratum_pool_core::stratum::ServerCore;

#[derive(Clone)]
struct ApiState {
    server: Arc<ServerCore>,
}

async fn api_health(axum::extract::State(state): axum::extract::State<ApiState>) -> Json<serde_json::Value> {
    let cache_ok = state.server.cache_ping().await;
    Json(json!({ "status": "ok", "cache": cache_ok }))
}

async fn api_metrics() -> impl IntoResponse {
    let body = stratum_pool_core::metrics::render();
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::load();
    tracing::info!("starting stratum pool core on port {}", config.stratum_port);

    let store = Arc::new(PersistentStore::new(config.database_url.clone(), config.store_pool.clone()));
    if let Err(e) = store.init_schema().await {
        tracing::error!("store schema bootstrap failed: {}", e);
    }

    let cache = Arc::new(
        Cache::connect(&config.redis_url)
            .await
            .unwrap_or_else(|e| panic!("cache connect failed at startup: {}", e)),
    );

    let rpc = Arc::new(CoinRpcClient::new(config.coin_rpc_url.clone(), config.coin_rpc_timeout()));

    // Placeholder per spec §9: MUST be replaced with a real proof-of-work
    // check before production use.
    let algorithm = Arc::new(AcceptAllAlgorithm);

    let server = ServerCore::new(&config, store.clone(), cache.clone(), algorithm);

    let (done_tx, done_rx) = tokio::sync::watch::channel(false);

    let poller = Arc::new(TemplatePoller::new(rpc, Duration::from_secs(config.template_poll_interval_secs)));
    let poller_server = server.clone();
    let poller_handle = poller.clone();
    tokio::spawn(async move {
        poller_handle
            .run(move |tmpl| {
                let server = poller_server.clone();
                tokio::spawn(async move {
                    server.apply_template(tmpl).await;
                });
            })
            .await;
    });

    let keepalive = server.keepalive.clone();
    let keepalive_server = server.clone();
    let _sweeper = keepalive.spawn_sweeper(move |conn_id| {
        let server = keepalive_server.clone();
        tokio::spawn(async move {
            server.remove_connection(&conn_id).await;
            stratum_pool_core::metrics::inc_keepalive_disconnects();
        });
    });

    let server_task = {
        let server = server.clone();
        let bind_addr: std::net::SocketAddr = config.listen_addr().parse()?;
        tokio::spawn(async move {
            if let Err(e) = server.run(bind_addr, done_rx).await {
                tracing::error!("stratum server exited with error: {}", e);
            }
        })
    };

    let api_state = ApiState { server: server.clone() };
    let api = Router::new()
        .route("/health", get(api_health))
        .route("/metrics", get(api_metrics))
        .with_state(api_state);

    let api_listener = tokio::net::TcpListener::bind(&config.metrics_listen).await?;
    tracing::info!("metrics/health API listening on {}", config.metrics_listen);

    let shutdown_signal = {
        let done_tx = done_tx.clone();
        async move {
            let ctrl_c = async {
                tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
                _ = ctrl_c => {}
                _ = terminate => {}
            }
            tracing::info!("shutdown signal received");
            let _ = done_tx.send(true);
        }
    };

    axum::serve(api_listener, api).with_graceful_shutdown(shutdown_signal).await?;

    server_task.await.ok();
    tracing::info!("clean shutdown complete");
    Ok(())
}
