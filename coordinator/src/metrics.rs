//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connector status
//! - Order lifecycle counts
//! - Swap settlement outcomes
//! - Protocol message traffic

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, Counter, CounterVec, Encoder,
    GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

use crate::error::{CoordinatorError, CoordinatorResult};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "crossdex_chain_connected",
        "Chain connector status (1=connected, 0=disconnected)",
        &["currency"]
    ).unwrap();

    // Order metrics
    pub static ref ORDERS_CREATED: Counter = register_counter!(
        "crossdex_orders_created_total",
        "Total orders registered by the coordinator"
    ).unwrap();

    pub static ref ORDERS_ACCEPTED: Counter = register_counter!(
        "crossdex_orders_accepted_total",
        "Total orders paired with a taker"
    ).unwrap();

    pub static ref ORDERS_CANCELLED: Counter = register_counter!(
        "crossdex_orders_cancelled_total",
        "Total orders cancelled"
    ).unwrap();

    pub static ref ORDERS_EXPIRED: Counter = register_counter!(
        "crossdex_orders_expired_total",
        "Total orders dropped by the expiry sweep"
    ).unwrap();

    // Swap metrics
    pub static ref SWAPS_FINISHED: Counter = register_counter!(
        "crossdex_swaps_finished_total",
        "Total swaps settled on both chains"
    ).unwrap();

    pub static ref SWAPS_ROLLED_BACK: Counter = register_counter!(
        "crossdex_swaps_rolled_back_total",
        "Total swaps resolved by refund"
    ).unwrap();

    // Protocol metrics
    pub static ref PROTOCOL_MESSAGES: CounterVec = register_counter_vec!(
        "crossdex_protocol_messages_total",
        "Protocol messages handled by type",
        &["message"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> CoordinatorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CoordinatorError::Unknown(e.to_string()))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| CoordinatorError::Unknown(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_chain_health(currency: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[currency])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_order_created() {
    ORDERS_CREATED.inc();
}

pub fn record_order_accepted() {
    ORDERS_ACCEPTED.inc();
}

pub fn record_order_cancelled() {
    ORDERS_CANCELLED.inc();
}

pub fn record_order_expired() {
    ORDERS_EXPIRED.inc();
}

pub fn record_swap_finished() {
    SWAPS_FINISHED.inc();
}

pub fn record_swap_rolled_back() {
    SWAPS_ROLLED_BACK.inc();
}

pub fn record_protocol_message(name: &str) {
    PROTOCOL_MESSAGES.with_label_values(&[name]).inc();
}
