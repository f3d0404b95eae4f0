use std::future::Future;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    application::{
        config::{Args, RuntimeConfig},
        state::SharedState,
    },
    domain::error::ControlError,
    interfaces::http,
};

pub async fn run(args: Args) -> Result<(), ControlError> {
    let config = RuntimeConfig::from_args(args)
        .map_err(|error| ControlError::InvalidRequest(format!("configuration error: {error}")))?;

    init_logging(&config.log_filter, config.json_logs)?;
    let listener = TcpListener::bind(config.bind_addr())
        .await
        .map_err(|error| ControlError::Unavailable(format!("failed to bind listener: {error}")))?;

    let signal = shutdown_signal();
    run_with_listener(listener, config, signal).await
}

pub async fn run_with_listener(
    listener: TcpListener,
    config: RuntimeConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ControlError> {
    let state = SharedState::new(config)?;
    run_with_state(listener, state, shutdown).await
}

pub async fn run_with_state(
    listener: TcpListener,
    state: SharedState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ControlError> {
    info!(
        "starting fleetd host={} port={} devices={} store={}",
        state.config().host,
        state.config().port,
        state.scheduler().total_devices(),
        if state.has_store() { "connected" } else { "none" }
    );

    let sweeper_task = spawn_fleet_sweeper(state.clone());
    let recovery_task = spawn_recovery_loop(state.clone());
    let serve_result = http::serve(listener, state, shutdown).await;

    sweeper_task.abort();
    if let Err(error) = sweeper_task.await {
        if !error.is_cancelled() {
            warn!("fleet sweeper task aborted: {error}");
        }
    }
    if let Some(task) = recovery_task {
        task.abort();
        if let Err(error) = task.await {
            if !error.is_cancelled() {
                warn!("recovery loop task aborted: {error}");
            }
        }
    }

    serve_result
}

fn init_logging(filter: &str, json_logs: bool) -> Result<(), ControlError> {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(env_filter).with_target(false);

    if json_logs {
        builder.json().try_init().map_err(|error| {
            ControlError::Unavailable(format!("failed to initialize logger: {error}"))
        })?;
    } else {
        builder.compact().try_init().map_err(|error| {
            ControlError::Unavailable(format!("failed to initialize logger: {error}"))
        })?;
    }

    Ok(())
}

fn spawn_fleet_sweeper(state: SharedState) -> tokio::task::JoinHandle<()> {
    let sweep_interval = state.config().sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            state.sweep_devices();
            state.sweep_sessions().await;
        }
    })
}

fn spawn_recovery_loop(state: SharedState) -> Option<tokio::task::JoinHandle<()>> {
    if !state.config().recovery_enabled {
        info!("auto-recovery disabled by runtime config");
        return None;
    }

    let poll_interval = state.config().recovery_poll_interval;
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            state.recovery_tick().await;
        }
    }))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
