#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use decrypter::{PoolObserver, VerifierPool};
use server::config::{CliArgs, ServerConfig};
use server::service::handler::{AppState, router};
use server::telemetry::init_telemetry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let observer: Arc<dyn PoolObserver> = providers.metrics.clone();
    let pool = Arc::new(
        VerifierPool::builder()
            .workers(config.num_workers)
            .queue_capacity(config.queue_capacity)
            .shutdown_timeout(config.shutdown_timeout)
            .shared_observer(observer)
            .build()?,
    );

    let state = AppState::new(
        Arc::clone(&pool),
        Arc::clone(&providers.metrics),
        config.submit_timeout,
    );

    let listener = TcpListener::bind(config.server_addr).await?;
    log_startup_info(&config);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Every HTTP request has returned by now, so the drain only has to cover
    // submissions whose callers already went away.
    if let Err(_e) = pool.shutdown().await {
        #[cfg(feature = "tracing")]
        tracing::error!("Error during pool shutdown: {:?}", _e);
    }

    providers.shutdown();

    #[cfg(feature = "tracing")]
    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(_config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting decrypter on {} with full config: {:#?}",
            _config.server_addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting decrypter on {} with {} workers",
            _config.server_addr,
            _config.num_workers
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");
}
