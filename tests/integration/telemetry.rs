use crate::*;

fn load_values(collector: &Collector, id: u32) -> Vec<f64> {
    collector
        .samples
        .recent(id)
        .into_iter()
        .flat_map(|b| b.samples)
        .map(|s| match s {
            Sample::Load(l) => l.one,
            other => panic!("unexpected sample {other:?}"),
        })
        .collect()
}

/// Periodic pushes carry every sample to the sink, in production order.
#[tokio::test]
async fn samples_reach_the_sink_in_order() -> Result<()> {
    let collector = Collector::start(fast_snapshot()).await?;
    let node = Node::new(collector.url(), NodeIdentity::fresh("edge-1"));
    assert!(node.session.connect().await);
    let id = node.id();
    let tasks = node.session.start();
    let (sampler, _produced) = CountingSampler::boxed();
    let healthbeat = node.healthbeat(vec![sampler]);

    assert!(wait_until(Duration::from_secs(5), || collector.samples_in(id) >= 10).await);

    let values = load_values(&collector, id);
    let expected: Vec<f64> = (1..=values.len()).map(|n| n as f64).collect();
    assert_eq!(values, expected);
    let batch = &collector.samples.recent(id)[0];
    assert_eq!(batch.node_id, id);
    assert_eq!(batch.hostname, "edge-1");

    node.shutdown.trigger();
    healthbeat.await?;
    tasks.join().await;
    collector.shutdown.trigger();
    Ok(())
}

/// Samples taken after the last periodic push arrive exactly once when the
/// node shuts down.
#[tokio::test]
async fn shutdown_delivers_unpushed_samples_once() -> Result<()> {
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

    assert!(wait_until(Duration::from_secs(2), || produced.load(Ordering::SeqCst) >= 5).await);
    assert_eq!(collector.samples_in(id), 0, "nothing is pushed before the period");

    node.shutdown.trigger();
    healthbeat.await?;
    tasks.join().await;

    let total = produced.load(Ordering::SeqCst) as u64;
    assert!(wait_until(Duration::from_secs(2), || collector.samples_in(id) == total).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(collector.samples_in(id), total);
    assert_eq!(load_values(&collector, id).len() as u64, total);

    collector.shutdown.trigger();
    Ok(())
}

/// Garbage from a node is counted and dropped without ending its link.
#[tokio::test]
async fn malformed_payloads_do_not_end_the_link() -> Result<()> {
    use fleetbeat_core::wire::Envelope;

    let collector = Collector::start(fast_snapshot()).await?;
    let node = Node::new(collector.url(), NodeIdentity::fresh("edge-1"));
    assert!(node.session.connect().await);
    let id = node.id();
    let tasks = node.session.start();

    let queue = node.session.queue();
    queue.push(&Envelope::new(id, 0, Kind::CpuData, b"not json".to_vec()))?;
    let good = Sample::Load(LoadSample {
        timestamp_ms: 1,
        one: 7.0,
        five: 0.0,
        fifteen: 0.0,
        uptime_secs: 1,
    });
    queue.push(&Envelope::new(id, 0, Kind::LoadData, good.encode()?))?;

    assert!(wait_until(Duration::from_secs(2), || collector.samples_in(id) == 1).await);
    let entry = collector.registry.get(id).unwrap();
    assert_eq!(entry.decode_errors.load(Ordering::Relaxed), 1);
    assert!(entry.is_connected());
    assert!(node.session.is_connected());

    node.shutdown.trigger();
    tasks.join().await;
    collector.shutdown.trigger();
    Ok(())
}
