use crate::*;

/// A snapshot pushed on the collector replaces the node's whole config and
/// restarts its producers on the new periods.
#[tokio::test]
async fn pushed_config_reaches_the_node() -> Result<()> {
    let collector = Collector::start(fast_snapshot()).await?;
    let node = Node::new(collector.url(), NodeIdentity::fresh("edge-1"));
    assert!(node.session.connect().await);
    let id = node.id();
    let tasks = node.session.start();
    let (sampler, produced) = CountingSampler::boxed();
    let healthbeat = node.healthbeat(vec![sampler]);

    let paused = ConfigSnapshot {
        load_period_ms: 0,
        ..fast_snapshot()
    };
    collector.registry.get(id).unwrap().push_config(paused)?;
    assert!(wait_until(Duration::from_secs(2), || node.session.config() == paused).await);

    // Producers are stopped; the count settles.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = produced.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(produced.load(Ordering::SeqCst), settled);

    collector.registry.get(id).unwrap().push_config(fast_snapshot())?;
    assert!(
        wait_until(Duration::from_secs(2), || produced.load(Ordering::SeqCst) > settled).await
    );

    node.shutdown.trigger();
    healthbeat.await?;
    tasks.join().await;
    collector.shutdown.trigger();
    Ok(())
}

/// A `flush` command pushes buffered samples without waiting for the period.
#[tokio::test]
async fn flush_command_pushes_immediately() -> Result<()> {
    let snapshot = ConfigSnapshot {
        push_period_ms: 60_000,
        ..fast_snapshot()
    };
    let collector = Collector::start(snapshot).await?;
    let node = Node::new(collector.url(), NodeIdentity::fresh("edge-1"));
    assert!(node.session.connect().await);
    let id = node.id();
    let tasks = node.session.start();
    let (sampler, produced) = CountingSampler::boxed();
    let healthbeat = node.healthbeat(vec![sampler]);

    assert!(wait_until(Duration::from_secs(2), || produced.load(Ordering::SeqCst) >= 3).await);
    assert_eq!(collector.samples_in(id), 0);

    collector.registry.get(id).unwrap().send_command("flush")?;
    assert!(wait_until(Duration::from_secs(2), || collector.samples_in(id) >= 3).await);

    node.shutdown.trigger();
    healthbeat.await?;
    tasks.join().await;
    collector.shutdown.trigger();
    Ok(())
}

/// Config pushed while a node is away is waiting for it when it returns.
#[tokio::test]
async fn config_pushed_while_offline_is_applied_on_return() -> Result<()> {
    let collector = Collector::start(fast_snapshot()).await?;
    let first = Node::new(collector.url(), NodeIdentity::fresh("edge-1"));
    assert!(first.session.connect().await);
    let identity = first.session.identity();
    let tasks = first.session.start();
    first.shutdown.trigger();
    tasks.join().await;

    let entry = collector.registry.get(identity.id).unwrap();
    assert!(wait_until(Duration::from_secs(2), || !entry.is_connected()).await);
    let slower = ConfigSnapshot {
        cpu_period_ms: 2_000,
        ..fast_snapshot()
    };
    entry.push_config(slower)?;

    let second = Node::new(collector.url(), identity);
    assert!(second.session.connect().await);
    assert_eq!(second.session.config(), slower, "handshake carries the stored snapshot");

    second.shutdown.trigger();
    collector.shutdown.trigger();
    Ok(())
}
