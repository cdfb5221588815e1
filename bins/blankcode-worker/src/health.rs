// Liveness and Prometheus metrics over HTTP.

use crate::worker::shutdown_requested;
use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

lazy_static! {
    pub static ref JOBS_PROCESSED: IntCounterVec = register_int_counter_vec!(
        "blankcode_jobs_processed_total",
        "Graded submissions by final status",
        &["status"]
    )
    .unwrap();
    pub static ref JOB_FAILURES: IntCounterVec = register_int_counter_vec!(
        "blankcode_job_failures_total",
        "Jobs that raised instead of producing a verdict, by outcome",
        &["outcome"]
    )
    .unwrap();
    pub static ref GRADING_SECONDS: HistogramVec = register_histogram_vec!(
        "blankcode_grading_seconds",
        "Wall time of one grading attempt",
        &["language"],
        vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0]
    )
    .unwrap();
    pub static ref JOBS_IN_FLIGHT: IntGauge =
        register_int_gauge!("blankcode_jobs_in_flight", "Jobs currently being graded").unwrap();
    pub static ref STALE_RECOVERED: IntCounter = register_int_counter!(
        "blankcode_stale_recovered_total",
        "Submissions moved from running to error by the recovery sweep"
    )
    .unwrap();
}

/// Render every registered metric in the Prometheus text format.
pub fn metrics_text() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "in_flight": JOBS_IN_FLIGHT.get(),
        })),
    )
}

async fn metrics() -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        metrics_text(),
    )
}

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
}

/// Serve until `shutdown` flips to true.
pub async fn serve(addr: SocketAddr, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Health server listening");
    axum::serve(listener, router())
        .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
        .await?;
    Ok(())
}
