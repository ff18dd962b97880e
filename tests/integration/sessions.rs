use crate::*;

use fleetbeat_core::wire::{Envelope, Kind, COLLECTOR_ID};
use fleetbeat_services::samples::{unix_ms, LoadSample};
use fleetbeat_services::{IdentityStore, Sample, SessionState};

/// A node with no identity is assigned one, and both sides persist it.
#[tokio::test]
async fn fresh_node_is_assigned_an_identity() -> Result<()> {
    let collector = Collector::start(fast_snapshot()).await?;
    let node = Node::new(collector.url(), NodeIdentity::fresh("edge-1"));

    assert!(node.session.connect().await);
    let id = node.id();
    assert_ne!(id, 0, "collector must assign a non-zero id");
    assert_eq!(node.session.config(), fast_snapshot());

    assert!(collector.registry.exists(id));
    let entry = collector.registry.get(id).unwrap();
    assert_eq!(entry.identity().hostname, "edge-1");
    assert!(
        wait_until(Duration::from_secs(2), || entry.state.get() == SessionState::Connected).await
    );

    let saved = node.store.load_identity("node")?.unwrap();
    assert_eq!(saved.id, id);
    let on_collector = collector
        .store
        .load_identity(&fleetbeat_services::store::node_key(id))?
        .unwrap();
    assert_eq!(on_collector.hostname, "edge-1");

    node.shutdown.trigger();
    collector.shutdown.trigger();
    Ok(())
}

/// Distinct nodes connecting at once all get distinct ids.
#[tokio::test]
async fn concurrent_nodes_get_distinct_ids() -> Result<()> {
    let collector = Collector::start(fast_snapshot()).await?;
    let nodes: Vec<Node> = (0..8)
        .map(|i| Node::new(collector.url(), NodeIdentity::fresh(&format!("edge-{i}"))))
        .collect();

    let mut dials = Vec::new();
    for node in &nodes {
        let session = node.session.clone();
        dials.push(tokio::spawn(async move { session.connect().await }));
    }
    for dial in dials {
        assert!(dial.await?);
    }

    let mut ids: Vec<u32> = nodes.iter().map(Node::id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert_eq!(collector.registry.len(), 8);

    for node in &nodes {
        node.shutdown.trigger();
    }
    collector.shutdown.trigger();
    Ok(())
}

/// A node that comes back with its assigned id lands on the same registry
/// entry, keeping its counters.
#[tokio::test]
async fn returning_node_reuses_its_entry() -> Result<()> {
    let collector = Collector::start(fast_snapshot()).await?;

    let first = Node::new(collector.url(), NodeIdentity::fresh("edge-1"));
    assert!(first.session.connect().await);
    let tasks = first.session.start();
    let identity = first.session.identity();
    let entry = collector.registry.get(identity.id).unwrap();
    assert!(wait_until(Duration::from_secs(2), || entry.is_connected()).await);

    first.shutdown.trigger();
    tasks.join().await;
    assert!(
        wait_until(Duration::from_secs(2), || entry.state.get() == SessionState::Disconnected)
            .await
    );

    let second = Node::new(
        collector.url(),
        NodeIdentity {
            hostname: "edge-1-renamed".into(),
            ..identity.clone()
        },
    );
    assert!(second.session.connect().await);
    assert_eq!(second.id(), identity.id);

    assert_eq!(collector.registry.len(), 1);
    let again = collector.registry.get(identity.id).unwrap();
    assert!(Arc::ptr_eq(&entry, &again));
    assert!(wait_until(Duration::from_secs(2), || again.is_connected()).await);
    assert_eq!(again.connects.load(Ordering::Relaxed), 2);
    assert_eq!(again.identity().hostname, "edge-1-renamed");

    second.shutdown.trigger();
    collector.shutdown.trigger();
    Ok(())
}

/// A collector that goes away takes the node through its reconnect attempts
/// and into termination, which raises the node's shutdown signal.
#[tokio::test]
async fn lost_collector_terminates_the_node() -> Result<()> {
    let collector = Collector::start(fast_snapshot()).await?;
    let node = Node::new(collector.url(), NodeIdentity::fresh("edge-1"));
    assert!(node.session.connect().await);
    let tasks = node.session.start();

    collector.shutdown.trigger();
    collector.task.await??;

    assert!(
        wait_until(Duration::from_secs(5), || {
            node.session.state() == SessionState::Terminated
        })
        .await
    );
    assert!(node.shutdown.is_triggered());
    assert!(node.session.connect_calls() >= 1 + fleetbeat_node::RECONNECT_ATTEMPTS);
    tasks.join().await;
    Ok(())
}

/// A node whose collector restarts within the reconnect attempts resumes on
/// the new link and delivers what was queued while it was away.
#[tokio::test]
async fn node_resumes_after_collector_restart() -> Result<()> {
    let first = Collector::start(fast_snapshot()).await?;
    let port = first.port;
    let node = Node::new(first.url(), NodeIdentity::fresh("edge-1"));
    assert!(node.session.connect().await);
    let id = node.id();
    let tasks = node.session.start();

    first.shutdown.trigger();
    first.task.await??;
    assert!(wait_until(Duration::from_secs(2), || !node.session.is_connected()).await);

    let queue = node.session.queue();
    for n in 1..=3u64 {
        let sample = Sample::Load(LoadSample {
            timestamp_ms: unix_ms(),
            one: n as f64,
            five: 0.0,
            fifteen: 0.0,
            uptime_secs: n,
        });
        queue.push(&Envelope::new(id, COLLECTOR_ID, Kind::LoadData, sample.encode()?))?;
    }
    assert_eq!(queue.len(), 3, "nothing is written while disconnected");

    let second = Collector::start_on(&format!("127.0.0.1:{port}"), fast_snapshot()).await?;
    assert!(wait_until(Duration::from_secs(3), || second.samples_in(id) == 3).await);
    assert_eq!(node.session.state(), SessionState::Connected);
    assert_eq!(node.id(), id, "the node keeps its identity across links");
    assert!(node.session.connect_calls() >= 2);
    assert!(queue.is_empty());
    assert!(!node.shutdown.is_triggered());

    let entry = second.registry.get(id).unwrap();
    assert_eq!(entry.identity().hostname, "edge-1");

    node.shutdown.trigger();
    tasks.join().await;
    second.shutdown.trigger();
    Ok(())
}
