//! Collector status and shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

#[derive(Deserialize)]
struct StatusResponse {
    uptime_secs: u64,
    nodes_known: usize,
    nodes_connected: usize,
    samples_in: u64,
    decode_errors: u64,
    defaults: serde_json::Value,
}

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Fleetbeat Collector Status");
    println!("═══════════════════════════════════════");
    println!("  Uptime           : {}s", resp.uptime_secs);
    println!("  Nodes known      : {}", resp.nodes_known);
    println!("  Nodes connected  : {}", resp.nodes_connected);
    println!("  Samples received : {}", resp.samples_in);
    println!("  Decode errors    : {}", resp.decode_errors);
    println!("\n  Default node config:");
    print_periods(&resp.defaults);

    Ok(())
}

/// Print the `*_ms` fields of a snapshot object, one per line.
pub fn print_periods(snapshot: &serde_json::Value) {
    if let Some(fields) = snapshot.as_object() {
        for (name, value) in fields {
            println!("    {:<16} : {}", name, value);
        }
    }
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    #[derive(Deserialize)]
    struct ShutdownResponse {
        message: String,
    }

    let resp: ShutdownResponse =
        post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
