//! Prometheus metrics helpers for the roost system.
//!
//! Centralized metrics initialization and common metric definitions used
//! across the sync engine and the CLI.
//!
//! # Usage
//!
//! ```rust,ignore
//! use roost_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     use metrics::counter;
//!     counter!("sync_batches_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`sync_`, `relay_`)
//! - Suffix: unit or type (`_total`, `_seconds`, `_unix`)
//! - Labels: used sparingly to avoid cardinality explosion

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle for use with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if the recorder is already
/// installed, instead of panicking. Useful for tests.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves the `/metrics` endpoint on the specified port. Spawns a background
/// task and returns immediately.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();
    });

    Ok(())
}

/// Register descriptions for common metrics used across roost.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Relay metrics
    // =========================================================================

    describe_counter!("relay_connects_total", "Successful relay connections");
    describe_counter!("relay_connect_failures_total", "Failed relay connections");
    describe_counter!(
        "relay_events_received_total",
        "Events delivered by relays to open subscriptions"
    );
    describe_counter!("relay_publish_acks_total", "Accepted publish acknowledgments");
    describe_counter!("relay_publish_rejects_total", "Rejected publish acknowledgments");
    describe_counter!("relay_auth_challenges_total", "NIP-42 challenges received");

    // =========================================================================
    // Sync engine metrics
    // =========================================================================

    describe_counter!("sync_runs_total", "Sync runs started");
    describe_counter!("sync_batches_total", "Batches fetched by the sync engine");
    describe_counter!(
        "sync_events_covered_total",
        "Events confirmed present on every target relay"
    );
    describe_counter!("sync_events_published_total", "Events republished to missing relays");
    describe_counter!(
        "sync_deletion_skips_total",
        "Publishes skipped because every target reported a deletion"
    );
    describe_counter!("sync_failures_total", "Sync runs that ended in failure");
    describe_gauge!("sync_in_progress", "1 while a sync run is active");
    describe_gauge!("sync_cursor_unix", "Current pagination cursor (unix seconds)");
    describe_histogram!(
        "sync_batch_duration_seconds",
        "Wall-clock duration of a single batch fetch"
    );
}
