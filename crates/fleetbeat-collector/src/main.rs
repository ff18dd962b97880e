//! fleetbeat-collector: accepts node telemetry links and serves the status API.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;

use fleetbeat_collector::{Dispatcher, ListenerContext, NodeListener};
use fleetbeat_core::config::{CollectorConfig, ConfigFile};
use fleetbeat_services::{
    new_node_registry, FanoutSink, FileIdentityStore, JsonlSink, LogSink, MemorySink, MetricsSink,
    Shutdown,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = CollectorConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CollectorConfig::load_or_default();
    tracing::info!(
        port = config.network.port,
        api_port = config.network.api_port,
        "fleetbeat-collector starting"
    );

    // Sinks. The memory sink always runs so the API can show latest samples.
    let memory = Arc::new(MemorySink::new(config.storage.retain_batches));
    let primary: Arc<dyn MetricsSink> = match config.storage.sink.as_str() {
        "jsonl" => Arc::new(JsonlSink::new(config.storage.samples_dir.clone())?),
        "memory" => memory.clone(),
        "log" => Arc::new(LogSink),
        other => {
            tracing::warn!(sink = other, "unknown sink, falling back to log");
            Arc::new(LogSink)
        }
    };
    let sink: Arc<dyn MetricsSink> = if config.storage.sink == "memory" {
        primary
    } else {
        let memory: Arc<dyn MetricsSink> = memory.clone();
        Arc::new(FanoutSink::new(vec![primary, memory]))
    };
    tracing::info!(sink = sink.name(), "sample sink ready");

    let store = Arc::new(FileIdentityStore::new(config.storage.identity_dir.clone()));
    let registry = new_node_registry();

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

    // ── Spawn tasks ──────────────────────────────────────────────────────────
    let listener = NodeListener::bind(
        &format!("{}:{}", config.network.listen_address, config.network.port),
        ListenerContext {
            registry: registry.clone(),
            store,
            dispatcher: Arc::new(Dispatcher::new(sink)),
            defaults: config.defaults,
            shutdown: shutdown.clone(),
        },
    )
    .await?;
    let listener_task = tokio::spawn(listener.run());

    let api_state = fleetbeat_api::ApiState {
        registry: registry.clone(),
        samples: memory,
        defaults: config.defaults,
        started: Instant::now(),
        shutdown: shutdown.clone(),
    };
    let api_port = config.network.api_port;
    let api_task = tokio::spawn(async move {
        if let Err(e) = fleetbeat_api::serve(api_state, api_port).await {
            tracing::error!(error = %e, "status API failed");
        }
    });

    // ── Wait for exit ────────────────────────────────────────────────────────
    let mut stop = shutdown.subscribe();
    tokio::select! {
        _ = stop.recv()   => tracing::info!("shutting down"),
        r = listener_task => tracing::error!("node listener exited: {:?}", r),
        r = api_task      => tracing::error!("status API exited: {:?}", r),
    }

    tracing::info!(nodes = registry.len(), "fleetbeat-collector stopped");
    Ok(())
}
