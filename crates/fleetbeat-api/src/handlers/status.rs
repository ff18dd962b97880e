//! /status and /daemon/shutdown handlers.

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use fleetbeat_core::snapshot::ConfigSnapshot;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub nodes_known: usize,
    pub nodes_connected: usize,
    pub samples_in: u64,
    pub decode_errors: u64,
    pub defaults: ConfigSnapshot,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let nodes = state.registry.snapshot();
    let nodes_connected = nodes.iter().filter(|(_, n)| n.is_connected()).count();
    let samples_in = nodes
        .iter()
        .map(|(_, n)| n.samples_in.load(Ordering::Relaxed))
        .sum();
    let decode_errors = nodes
        .iter()
        .map(|(_, n)| n.decode_errors.load(Ordering::Relaxed))
        .sum();

    Json(StatusResponse {
        uptime_secs: state.started.elapsed().as_secs(),
        nodes_known: nodes.len(),
        nodes_connected,
        samples_in,
        decode_errors,
        defaults: state.defaults,
    })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    state.shutdown.trigger();

    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
