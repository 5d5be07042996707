mod alert;
mod auth;
mod config;
mod dispatch;
mod domains;
mod engine;
mod error;
mod host;
mod retention;
mod routes;
mod runner;
mod scheduler;
mod server;
mod state;
mod store;

use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use alert::{AlertSink, ChatSink, LogOnlySink};
use config::{CliArgs, WatchConfig, SHUTDOWN_GRACE_SECS};
use dispatch::{DispatchClient, DispatchConfig};
use state::WatchState;
use store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pagewatch=info,tower_http=info".into()),
        )
        .init();

    let args = CliArgs::parse();
    let config = WatchConfig::from_args(args);
    info!("Starting pagewatch v{}", env!("CARGO_PKG_VERSION"));
    info!("Data dir: {:?}", config.data_dir);
    info!("Workers: {}", config.workers);

    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(config.artifacts_dir())?;
    std::fs::create_dir_all(config.sources_dir())?;
    runner::sandbox::materialize_runners(&config)?;

    let store = Store::open(config.db_path())?;
    info!("Store opened at {:?}", config.db_path());

    let http_for_sinks = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    let alerts: Arc<dyn AlertSink> = if config.alerts_enabled
        && !config.chat_bot_token.is_empty()
        && !config.chat_id.is_empty()
    {
        Arc::new(ChatSink::new(
            http_for_sinks.clone(),
            config.chat_bot_token.clone(),
            config.chat_id.clone(),
        ))
    } else {
        warn!("Alert transport not configured; alerts will only be logged");
        Arc::new(LogOnlySink)
    };

    let dispatch = if config.dispatch_enabled && !config.dispatch_base_url.is_empty() {
        Some(DispatchClient::new(
            http_for_sinks,
            DispatchConfig {
                base_url: config.dispatch_base_url.clone(),
                token: config.dispatch_token.clone(),
                model: config.dispatch_model.clone(),
                poll_interval: std::time::Duration::from_secs(config.dispatch_poll_seconds),
                max_wait: std::time::Duration::from_secs(config.dispatch_max_wait_seconds),
            },
        ))
    } else {
        None
    };

    let listen = config.listen.clone();
    let state = Arc::new(WatchState::new(config, store, alerts, dispatch));

    // Neutralize leases abandoned by a previous process before scheduling
    // anything new.
    runner::recover_stale_leases(&state).await;

    let domains = domains::init_domains(&state)?;
    #[cfg(unix)]
    let _reload_handle = domains::spawn_reload_handler(state.clone(), domains.clone());

    let _scheduler_handle = scheduler::spawn_scheduler(state.clone(), domains);
    let worker_handles = runner::spawn_workers(state.clone());
    let _heartbeat_handle = engine::spawn_heartbeat(state.clone());
    let _retention_handle = retention::spawn_retention(state.clone());
    let _host_health_handle = host::spawn_host_health(state.clone());

    let router = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("Registry API listening on http://{}", listen);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    info!(
        "Shutting down; waiting up to {}s for in-flight runs",
        SHUTDOWN_GRACE_SECS
    );
    let drain = futures_join_all(worker_handles);
    if tokio::time::timeout(
        std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS),
        drain,
    )
    .await
    .is_err()
    {
        warn!("Workers did not drain in time; exiting anyway");
    }

    info!("pagewatch stopped");
    Ok(())
}

async fn futures_join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for h in handles {
        let _ = h.await;
    }
}

async fn shutdown_signal(state: state::SharedState) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal");
    let _ = state.shutdown_tx.send(());
}
