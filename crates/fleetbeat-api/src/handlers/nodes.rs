//! /nodes handlers: node listing, inspection and control.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use fleetbeat_core::snapshot::ConfigSnapshot;
use fleetbeat_services::{NodeInfo, Sample};

use super::{lookup, ApiState};

// ── /nodes ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeInfo>,
}

pub async fn handle_nodes(State(state): State<ApiState>) -> Json<NodesResponse> {
    let nodes = state
        .registry
        .snapshot()
        .into_iter()
        .map(|(_, node)| node.info())
        .collect();
    Json(NodesResponse { nodes })
}

// ── /nodes/{id} ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct NodeInspectResponse {
    pub node: NodeInfo,
    /// Newest sample of each metric, ordered by kind.
    pub latest: Vec<Sample>,
}

pub async fn handle_node_inspect(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeInspectResponse>, (StatusCode, String)> {
    let node = lookup(&state, &node_id)?;
    Ok(Json(NodeInspectResponse {
        latest: state.samples.latest(node.id()),
        node: node.info(),
    }))
}

// ── /nodes/{id}/config ───────────────────────────────────────────────────────

/// Fields to change. Anything omitted keeps the node's current value; the
/// node still receives one whole snapshot.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigUpdate {
    pub cpu_period_ms: Option<u32>,
    pub mem_period_ms: Option<u32>,
    pub net_period_ms: Option<u32>,
    pub load_period_ms: Option<u32>,
    pub push_period_ms: Option<u32>,
    pub ping_period_ms: Option<u32>,
    pub read_timeout_ms: Option<u32>,
}

impl ConfigUpdate {
    pub fn apply(&self, base: ConfigSnapshot) -> ConfigSnapshot {
        ConfigSnapshot {
            cpu_period_ms: self.cpu_period_ms.unwrap_or(base.cpu_period_ms),
            mem_period_ms: self.mem_period_ms.unwrap_or(base.mem_period_ms),
            net_period_ms: self.net_period_ms.unwrap_or(base.net_period_ms),
            load_period_ms: self.load_period_ms.unwrap_or(base.load_period_ms),
            push_period_ms: self.push_period_ms.unwrap_or(base.push_period_ms),
            ping_period_ms: self.ping_period_ms.unwrap_or(base.ping_period_ms),
            read_timeout_ms: self.read_timeout_ms.unwrap_or(base.read_timeout_ms),
        }
    }
}

#[derive(Serialize)]
pub struct ConfigPushResponse {
    pub node_id: String,
    pub config: ConfigSnapshot,
    pub delivered_now: bool,
}

pub async fn handle_node_config(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<ConfigPushResponse>, (StatusCode, String)> {
    let node = lookup(&state, &node_id)?;
    let config = update.apply(node.config());
    if config.push_period_ms == 0 || config.ping_period_ms == 0 || config.read_timeout_ms == 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "push, ping and read-timeout periods must be non-zero".to_string(),
        ));
    }

    node.push_config(config)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    tracing::info!(node = %node.identity(), ?config, "config pushed via API");

    Ok(Json(ConfigPushResponse {
        node_id,
        config,
        delivered_now: node.is_connected(),
    }))
}

// ── /nodes/{id}/command ──────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Serialize)]
pub struct CommandResponse {
    pub node_id: String,
    pub queued: bool,
}

pub async fn handle_node_command(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, (StatusCode, String)> {
    let command = req.command.trim();
    if command.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "command must not be empty".to_string()));
    }
    let node = lookup(&state, &node_id)?;
    node.send_command(command)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    tracing::info!(node = %node.identity(), command, "command queued via API");

    Ok(Json(CommandResponse {
        node_id,
        queued: true,
    }))
}
