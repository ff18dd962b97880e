//! fleetbeat-node: telemetry agent.

use std::sync::Arc;

use anyhow::Result;

use fleetbeat_core::config::{ConfigFile, NodeConfig};
use fleetbeat_core::identity::NodeIdentity;
use fleetbeat_node::{Healthbeat, Session, SessionOptions};
use fleetbeat_services::{host_samplers, FileIdentityStore, IdentityStore, SessionState, Shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = NodeConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = NodeConfig::load_or_default();
    let options = SessionOptions::from_config(&config);
    tracing::info!(url = %options.url, "fleetbeat-node starting");

    // Identity
    let store_dir = config
        .identity
        .path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(fleetbeat_core::config::data_dir);
    let store = Arc::new(FileIdentityStore::new(store_dir));
    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
    let mut identity = match store.load_identity(&options.identity_key) {
        Ok(Some(identity)) => identity,
        Ok(None) => NodeIdentity::fresh(&hostname),
        Err(e) => {
            tracing::warn!(error = %e, "unreadable identity record, starting fresh");
            NodeIdentity::fresh(&hostname)
        }
    };
    for (field, configured) in [
        (&mut identity.region, &config.identity.region),
        (&mut identity.zone, &config.identity.zone),
        (&mut identity.datacenter, &config.identity.datacenter),
    ] {
        if field.is_empty() {
            field.clone_from(configured);
        }
    }
    tracing::info!(node = %identity, assigned = identity.is_assigned(), "identity loaded");

    // ── Shutdown signal ──────────────────────────────────────────────────────
    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            shutdown.trigger();
        });
    }

    let session = Arc::new(Session::new(options, identity, store, shutdown.clone()));
    if !session.connect().await {
        anyhow::bail!("collector unreachable");
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────
    let tasks = session.start();
    let healthbeat = tokio::spawn(
        Healthbeat::new(
            session.queue(),
            session.source_id(),
            session.subscribe_config(),
            session.flush_requests(),
            host_samplers(),
            shutdown.subscribe(),
        )
        .run(),
    );

    if let Err(e) = healthbeat.await {
        tracing::error!(error = %e, "healthbeat panicked");
    }
    tasks.join().await;

    if session.state() == SessionState::Terminated {
        anyhow::bail!("session terminated: collector lost");
    }
    tracing::info!(left = session.queue().len(), "fleetbeat-node stopped");
    Ok(())
}
