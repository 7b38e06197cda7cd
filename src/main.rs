use std::sync::Arc;
use tracing::{info, warn};
use vuoro::elector::{Elector, ElectorConfig, LeaderState, MongoLeaseStore};
use vuoro::scheduler::{LogJob, SchedulerCore};
use vuoro::server::{
    create_metrics, run_server, shutdown_channel, wait_for_signal, ApiState,
};
use vuoro::store::ScheduleStore;

/// Port serving the schedules API, /health and /metrics
const API_PORT: u16 = 8080;

/// Database used when the connection string names none
const DATABASE_NAME: &str = "scheduler";

/// Store endpoint from `MONGO_URI`
fn mongo_uri() -> String {
    std::env::var("MONGO_URI")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "mongodb://mongo:27017".to_string())
}

/// Election lease object name from `LEASE_KEY`
fn lease_key() -> String {
    std::env::var("LEASE_KEY")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "lease-key".to_string())
}

/// Tracing filter from `LOG_LEVEL` (DEBUG, INFO, WARN, ERROR)
fn log_filter() -> &'static str {
    match std::env::var("LOG_LEVEL")
        .unwrap_or_default()
        .to_uppercase()
        .as_str()
    {
        "DEBUG" => "debug",
        "WARN" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_filter()))
        .init();

    info!("starting vuoro scheduler");

    // Coordinated shutdown for every long-running component
    let (shutdown_controller, shutdown_signal) = shutdown_channel();

    let metrics = create_metrics()?;

    let uri = mongo_uri();
    info!(uri = %uri, "connecting to MongoDB");
    let client = mongodb::Client::with_uri_str(&uri).await?;
    let db = client
        .default_database()
        .unwrap_or_else(|| client.database(DATABASE_NAME));

    let store = Arc::new(ScheduleStore::new(&db));

    // Leader election: transitions are logged and mirrored into the gauge
    let leader_state = LeaderState::new();
    let lease_store = Arc::new(MongoLeaseStore::new(&db, lease_key()));
    let started_gauge = metrics.clone();
    let stopped_gauge = metrics.clone();
    let elector = Elector::new(lease_store, ElectorConfig::from_env(), leader_state.clone())?
        .on_started_leading(move |candidate| {
            info!(candidate, "started leading");
            started_gauge.set_leader(true);
        })
        .on_stopped_leading(move |candidate| {
            info!(candidate, "stopped leading");
            stopped_gauge.set_leader(false);
        })
        .on_new_leader(|candidate, leader| {
            info!(candidate, leader, "new leader elected");
        });
    let elector_handle = tokio::spawn(elector.run(shutdown_signal.clone()));

    // REST facade in the background
    let api_state = ApiState::new(store.clone(), metrics.clone());
    let server_signal = shutdown_signal.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = run_server(API_PORT, api_state, server_signal).await {
            warn!(error = %e, "API server failed");
        }
    });

    // The scheduler core: snapshot, change feed, wheel
    let core = Arc::new(SchedulerCore::new(
        store.clone(),
        leader_state,
        Arc::new(LogJob),
        metrics.clone(),
    ));
    let mut core_handle = tokio::spawn(core.start(shutdown_signal));

    tokio::select! {
        result = &mut core_handle => {
            // The change feed ended on its own; a failed snapshot read or
            // watch open is a startup failure and exits non-zero
            info!("scheduler ended");
            shutdown_controller.shutdown();
            result??;
        }
        signal = wait_for_signal() => {
            info!(signal, "initiating graceful shutdown");
            shutdown_controller.shutdown();
            core_handle.await??;
        }
    }

    // Wait for the elector so a configured release is actually written
    if elector_handle.await.is_err() {
        warn!("elector task ended abnormally");
    }
    server_handle.abort();

    info!("vuoro shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
