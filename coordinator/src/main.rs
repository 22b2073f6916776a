//! crossdex coordinator - cross-chain atomic swap coordination
//!
//! Hosts the order book and, when the exchange role is enabled, sequences
//! hash-time-locked swaps between two UTXO chains as the service-node
//! coordinator.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crossdex_coordinator::config::Settings;
use crossdex_coordinator::driver::SwapDriver;
use crossdex_coordinator::exchange::Exchange;
use crossdex_coordinator::metrics::MetricsServer;
use crossdex_coordinator::order::OrderBook;
use crossdex_coordinator::rpc::{self, AppState};
use crossdex_coordinator::trading::BlockStore;
use crossdex_coordinator::wallet::ConnectorRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting crossdex coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} wallet sections",
        settings.enabled_wallets().len()
    );

    // Core state
    let exchange = Arc::new(Exchange::new(&settings));
    let registry = Arc::new(ConnectorRegistry::new());
    let book = Arc::new(OrderBook::new());
    let blocks = Arc::new(BlockStore::new());

    if exchange.is_enabled().await {
        info!("Exchange role enabled, acting as swap coordinator");
    }

    // Service-node network channel; chain adapters and the p2p transport
    // attach their endpoints here.
    let (net_tx, _) = broadcast::channel(10_000);

    // Swap driver
    let driver = Arc::new(SwapDriver::new(
        exchange.clone(),
        registry.clone(),
        book.clone(),
        net_tx.clone(),
        settings.coordinator.clone(),
    ));
    info!("Swap driver initialized");

    // Metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // RPC server
    let rpc_handle = tokio::spawn({
        let state = AppState {
            exchange: exchange.clone(),
            registry: registry.clone(),
            book: book.clone(),
            driver: driver.clone(),
            blocks: blocks.clone(),
        };
        let api = settings.api.clone();
        async move {
            if let Err(e) = rpc::run_server(api, state).await {
                error!("RPC server error: {}", e);
            }
        }
    });

    // Swap driver loop
    let driver_handle = tokio::spawn({
        let driver = driver.clone();
        async move {
            if let Err(e) = driver.run().await {
                error!("Swap driver error: {}", e);
            }
        }
    });

    // Connector health loop
    let health_handle = tokio::spawn({
        let registry = registry.clone();
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(60)).await;
                for (currency, healthy) in registry.health_check().await {
                    if !healthy {
                        warn!("Wallet {} health check failed", currency);
                    }
                }
            }
        }
    });

    info!("crossdex coordinator is running");
    info!("RPC server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    driver.stop().await;

    // Abort background tasks
    rpc_handle.abort();
    driver_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("crossdex coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,crossdex_coordinator=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
