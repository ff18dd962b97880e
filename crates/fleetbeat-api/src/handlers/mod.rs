//! HTTP API handlers: exposes collector state as JSON.

pub mod nodes;
pub mod status;

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;

use fleetbeat_core::snapshot::ConfigSnapshot;
use fleetbeat_services::{MemorySink, NodeRegistry, NodeSession, Shutdown};

#[derive(Clone)]
pub struct ApiState {
    pub registry: NodeRegistry,
    /// Recent batches per node, for the inspect view.
    pub samples: Arc<MemorySink>,
    /// Snapshot handed to nodes the collector has not configured yet.
    pub defaults: ConfigSnapshot,
    pub started: Instant,
    /// Raised by `/daemon/shutdown`.
    pub shutdown: Shutdown,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Parse a node id as the API prints it: eight hex digits.
fn parse_node_id(hex_str: &str) -> Result<u32, (StatusCode, String)> {
    let bytes =
        hex::decode(hex_str).map_err(|_| (StatusCode::BAD_REQUEST, "invalid hex".to_string()))?;
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| (StatusCode::BAD_REQUEST, "node id must be 4 bytes".to_string()))?;
    Ok(u32::from_be_bytes(arr))
}

fn lookup(state: &ApiState, hex_str: &str) -> Result<Arc<NodeSession>, (StatusCode, String)> {
    let id = parse_node_id(hex_str)?;
    state
        .registry
        .get(id)
        .ok_or((StatusCode::NOT_FOUND, "node not found".to_string()))
}

// Re-export handler functions for use in router setup.
pub use nodes::{handle_node_command, handle_node_config, handle_node_inspect, handle_nodes};
pub use status::{handle_shutdown, handle_status};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_parse_as_printed() {
        assert_eq!(parse_node_id("0000002a").unwrap(), 42);
        assert_eq!(parse_node_id(&format!("{:08x}", 0xdead_beef_u32)).unwrap(), 0xdead_beef);
    }

    #[test]
    fn bad_node_ids_are_rejected() {
        assert_eq!(parse_node_id("zz").unwrap_err().0, StatusCode::BAD_REQUEST);
        assert_eq!(parse_node_id("2a").unwrap_err().0, StatusCode::BAD_REQUEST);
        assert_eq!(parse_node_id("0000002a00").unwrap_err().0, StatusCode::BAD_REQUEST);
    }
}
