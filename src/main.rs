//! ap-relay binary entry point

use std::path::PathBuf;

use ap_relay::error::AppError;
use ap_relay::{build_router, config, AppState};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long in-flight HTTP handlers get to finish after shutdown
const DRAIN_DEADLINE: std::time::Duration = std::time::Duration::from_secs(20);

/// How long the fan-out workers get to finish their current delivery
const WORKER_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

#[tokio::main]
async fn main() {
    init_tracing();

    let exit_code = match run().await {
        Ok(()) => 0,
        Err(error) => {
            tracing::error!(%error, "Relay terminated");
            match error {
                AppError::Config(_) | AppError::Validation(_) => 1,
                AppError::Database(_) => 2,
                _ => 1,
            }
        }
    };

    std::process::exit(exit_code);
}

fn init_tracing() {
    let log_format = std::env::var("RELAY_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ap_relay=info,tower_http=warn".into());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Run the supervisor: config, state, listener, shutdown
async fn run() -> Result<(), AppError> {
    ap_relay::metrics::init_metrics();

    // 1. configuration
    let config_path = std::env::var("RELAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("relay.yaml"));
    let file_config = config::FileConfig::load(&config_path)?;
    tracing::info!(
        domain = %file_config.domain,
        workers = file_config.worker_count(),
        "Configuration loaded"
    );

    // 2. shared state (store, cache, workers)
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (state, delivery_handle) = AppState::new(file_config, shutdown_rx.clone()).await?;

    // 3. HTTP listener
    let app = build_router(state.clone());
    let bind_addr = format!("{}:{}", state.config.listen, state.config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| AppError::Config(format!("cannot bind {bind_addr}: {e}")))?;
    tracing::info!(%bind_addr, actor = %state.config.actor(), "Relay listening");

    // 4. serve until a signal arrives, then drain with a deadline
    let mut drain_rx = shutdown_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown({
        let mut rx = shutdown_rx.clone();
        async move {
            let _ = rx.changed().await;
        }
    });

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received");
        let _ = signal_tx.send(true);
    });

    tokio::select! {
        result = server => {
            result.map_err(|e| AppError::Internal(e.into()))?;
        }
        _ = async {
            let _ = drain_rx.changed().await;
            tokio::time::sleep(DRAIN_DEADLINE).await;
        } => {
            tracing::warn!("Drain deadline reached, closing remaining connections");
        }
    }

    // 5. let workers finish their current delivery
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(WORKER_DEADLINE, delivery_handle)
        .await
        .is_err()
    {
        tracing::warn!("Fan-out workers did not stop in time");
    }

    tracing::info!("Relay stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).expect("SIGTERM handler installation");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
