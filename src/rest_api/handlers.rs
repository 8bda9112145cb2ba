//! HTTP handlers for the probe and metrics endpoints

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tracing::instrument;

/// Flags the probes report on
#[derive(Clone, Debug)]
pub struct ProbeState {
    /// Set once both controllers have been started
    pub started: Arc<AtomicBool>,
    /// Shared with leader election
    pub leader: Arc<AtomicBool>,
}

impl ProbeState {
    pub fn new(leader: Arc<AtomicBool>) -> Self {
        Self {
            started: Arc::new(AtomicBool::new(false)),
            leader,
        }
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub leader: bool,
}

/// Liveness: the process is up and serving
#[instrument]
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness: controllers are running. Standby replicas are ready too, the
/// body tells whether this replica currently holds the lease.
#[instrument(skip(state))]
pub async fn readyz(State(state): State<ProbeState>) -> (StatusCode, Json<ReadyResponse>) {
    let leader = state.leader.load(Ordering::Relaxed);
    if !state.started.load(Ordering::Relaxed) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "starting",
                leader,
            }),
        );
    }
    let status = if leader { "leader" } else { "standby" };
    (StatusCode::OK, Json(ReadyResponse { status, leader }))
}

#[cfg(feature = "metrics")]
pub async fn metrics() -> Result<String, StatusCode> {
    use prometheus_client::encoding::text::encode;

    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY).map_err(|e| {
        tracing::error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(buffer)
}
