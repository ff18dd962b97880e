//! Node listing, inspection, config push and command commands.

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use super::http::{base_url, get_json, post_json_body};
use super::status::print_periods;

#[derive(Deserialize)]
#[allow(dead_code)]
struct NodeInfo {
    id: String,
    hostname: String,
    region: String,
    zone: String,
    datacenter: String,
    state: String,
    connected: bool,
    peer: Option<String>,
    established_ms: u64,
    last_seen_ms: u64,
    queued: usize,
    frames_in: u64,
    samples_in: u64,
    decode_errors: u64,
    connects: u64,
    config: serde_json::Value,
}

#[derive(Deserialize)]
struct NodesResponse {
    nodes: Vec<NodeInfo>,
}

pub async fn cmd_nodes(port: u16) -> Result<()> {
    let resp: NodesResponse = get_json(&format!("{}/nodes", base_url(port))).await?;

    if resp.nodes.is_empty() {
        println!("No nodes have connected yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Nodes ({})", resp.nodes.len());
    println!("═══════════════════════════════════════");

    for n in &resp.nodes {
        println!("  ┌─ {} ({})", n.id, n.hostname);
        println!("  │  state    : {}", n.state);
        println!("  │  peer     : {}", n.peer.as_deref().unwrap_or("-"));
        println!("  │  samples  : {}", n.samples_in);
        println!("  └─ queued   : {}", n.queued);
    }

    Ok(())
}

pub async fn cmd_node_inspect(port: u16, node_id: &str) -> Result<()> {
    #[derive(Deserialize)]
    struct InspectResponse {
        node: NodeInfo,
        latest: Vec<serde_json::Value>,
    }

    let resp: InspectResponse = get_json(&format!("{}/nodes/{}", base_url(port), node_id)).await?;
    let n = &resp.node;

    println!("═══════════════════════════════════════");
    println!("  Node {}", n.id);
    println!("═══════════════════════════════════════");
    println!("  Hostname      : {}", n.hostname);
    println!("  Location      : {}/{}/{}", n.region, n.zone, n.datacenter);
    println!("  State         : {}", n.state);
    println!("  Peer          : {}", n.peer.as_deref().unwrap_or("-"));
    println!("  Connects      : {}", n.connects);
    println!("  Frames in     : {}", n.frames_in);
    println!("  Samples in    : {}", n.samples_in);
    println!("  Decode errors : {}", n.decode_errors);
    println!("  Queued        : {}", n.queued);
    println!("\n  Config:");
    print_periods(&n.config);

    if resp.latest.is_empty() {
        println!("\n  No samples retained.");
    } else {
        println!("\n  Latest samples:");
        for sample in &resp.latest {
            println!("    {}", sample);
        }
    }

    Ok(())
}

/// `pairs` are `field=value` arguments, e.g. `cpu_period_ms=2000`.
pub async fn cmd_node_config(port: u16, node_id: &str, pairs: &[&str]) -> Result<()> {
    #[derive(Deserialize)]
    struct ConfigPushResponse {
        node_id: String,
        config: serde_json::Value,
        delivered_now: bool,
    }

    if pairs.is_empty() {
        bail!("config needs at least one field=value pair");
    }
    let mut body = serde_json::Map::new();
    for pair in pairs {
        let (field, value) = pair
            .split_once('=')
            .with_context(|| format!("expected field=value, got {}", pair))?;
        let value: u32 = value
            .parse()
            .with_context(|| format!("{} must be a number of milliseconds", field))?;
        body.insert(field.to_string(), value.into());
    }

    let resp: ConfigPushResponse = post_json_body(
        &format!("{}/nodes/{}/config", base_url(port), node_id),
        &serde_json::Value::Object(body),
    )
    .await?;

    if resp.delivered_now {
        println!("✓ Config sent to {}", resp.node_id);
    } else {
        println!("✓ Config queued for {} (node offline)", resp.node_id);
    }
    print_periods(&resp.config);
    Ok(())
}

pub async fn cmd_node_command(port: u16, node_id: &str, command: &str) -> Result<()> {
    #[derive(Deserialize)]
    struct CommandResponse {
        node_id: String,
        queued: bool,
    }

    let resp: CommandResponse = post_json_body(
        &format!("{}/nodes/{}/command", base_url(port), node_id),
        &serde_json::json!({ "command": command }),
    )
    .await?;

    if resp.queued {
        println!("✓ Command '{}' queued for {}", command, resp.node_id);
    }
    Ok(())
}
