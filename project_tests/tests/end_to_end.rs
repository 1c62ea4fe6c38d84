//! End-to-end tests: a mock relay feeds the ingestion adapter over a real
//! WebSocket, and subscribers receive samples through the full module stack.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::time::{sleep, timeout};

use lib_groundstation::configs::ModuleManifest;
use lib_groundstation::core::{
    ExtensionComposer, ModuleRegistry, ObjectProviderChain, Scalar, Subscription, TelemetryDatum,
    TelemetryProviderChain,
};
use lib_groundstation::ingestors::{ConnectionState, IngestConfig, IngestionAdapter};
use lib_groundstation::plugins::{self, habet};
use project_tests::MockSource;

const WAIT: Duration = Duration::from_secs(5);
const PERIOD: Duration = Duration::from_millis(200);

type Seen = Arc<Mutex<Vec<TelemetryDatum>>>;

struct Harness {
    adapter: Arc<IngestionAdapter>,
    objects: ObjectProviderChain,
    telemetry: TelemetryProviderChain,
}

fn harness(url: String) -> Result<Harness> {
    let adapter = Arc::new(IngestionAdapter::new(IngestConfig {
        url,
        distribution_period: PERIOD,
        reconnect_base_delay: Duration::from_millis(20),
        reconnect_max_delay: Duration::from_millis(100),
        ..IngestConfig::default()
    }));

    let catalog = plugins::catalog(Arc::clone(adapter.multiplexer()))?;
    let registry = Arc::new(ModuleRegistry::new());
    ModuleManifest::enable_all(&catalog).declare_into(&registry, catalog)?;
    let composer = Arc::new(ExtensionComposer::new(registry));

    Ok(Harness {
        adapter,
        objects: ObjectProviderChain::new(Arc::clone(&composer)),
        telemetry: TelemetryProviderChain::new(composer),
    })
}

impl Harness {
    async fn subscribe_point(&self) -> Result<(Seen, Subscription)> {
        let point = self
            .objects
            .get(&habet::point_identifier())
            .await
            .context("point object not found")?;
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = self
            .telemetry
            .subscribe(&point, Arc::new(move |d: &TelemetryDatum| sink.lock().unwrap().push(d.clone())))?;
        Ok((seen, subscription))
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn timestamps(seen: &Seen) -> Vec<Option<i64>> {
    seen.lock().unwrap().iter().map(|d| d.timestamp()).collect()
}

#[tokio::test]
async fn latest_sample_is_delivered_and_bursts_coalesce() -> Result<()> {
    let mut source = MockSource::bind().await?;
    let h = harness(source.url())?;
    let (seen, _subscription) = h.subscribe_point().await?;
    let tasks = h.adapter.spawn();
    let mut peer = source.next_peer(WAIT).await.context("adapter did not connect")?;

    peer.send_json(json!({"timestamp": 1000, "data": {"latitude": 1, "longitude": 2}}))
        .await?;
    wait_until(|| !seen.lock().unwrap().is_empty()).await;

    let first = seen.lock().unwrap()[0].clone();
    assert_eq!(first.timestamp(), Some(1000));
    assert_eq!(first.get("latitude"), Some(&Scalar::Integer(1)));
    assert_eq!(first.get("longitude"), Some(&Scalar::Integer(2)));

    // Right after a tick: both land inside the same period.
    peer.send_json(json!({"timestamp": 2000, "latitude": 3})).await?;
    peer.send_json(json!({"timestamp": 3000, "latitude": 5})).await?;
    wait_until(|| timestamps(&seen).iter().any(|ts| *ts != Some(1000))).await;

    let after_burst: Vec<_> = timestamps(&seen).into_iter().filter(|ts| *ts != Some(1000)).collect();
    assert_eq!(after_burst[0], Some(3000));
    assert!(!timestamps(&seen).contains(&Some(2000)));

    h.adapter.close();
    tasks.ingest.await??;
    tasks.distribution.await?;
    Ok(())
}

#[tokio::test]
async fn malformed_message_is_discarded_and_stream_continues() -> Result<()> {
    let mut source = MockSource::bind().await?;
    let h = harness(source.url())?;
    let (seen, _subscription) = h.subscribe_point().await?;
    let _tasks = h.adapter.spawn();
    let mut peer = source.next_peer(WAIT).await.context("adapter did not connect")?;

    peer.send_text("{ this is not json").await?;
    peer.send_json(json!({"data": {"latitude": 9}})).await?;
    peer.send_json(json!({"timestamp": 4000, "data": {"latitude": 4}})).await?;

    wait_until(|| !seen.lock().unwrap().is_empty()).await;
    assert!(timestamps(&seen).iter().all(|ts| *ts == Some(4000)));

    let stats = h.adapter.stats();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.rejected, 2);
    assert_eq!(h.adapter.state(), ConnectionState::Connected);
    h.adapter.close();
    Ok(())
}

#[tokio::test]
async fn adapter_reconnects_after_the_source_drops() -> Result<()> {
    let mut source = MockSource::bind().await?;
    let h = harness(source.url())?;
    let (seen, _subscription) = h.subscribe_point().await?;
    let mut states = h.adapter.watch_state();
    let _tasks = h.adapter.spawn();

    let first = source.next_peer(WAIT).await.context("adapter did not connect")?;
    first.close().await;

    let mut second = source.next_peer(WAIT).await.context("adapter did not reconnect")?;
    wait_until(|| h.adapter.state() == ConnectionState::Connected).await;
    second
        .send_json(json!({"timestamp": 5000, "data": {"latitude": 5}}))
        .await?;
    wait_until(|| !seen.lock().unwrap().is_empty()).await;
    assert_eq!(timestamps(&seen)[0], Some(5000));

    h.adapter.close();
    timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Closed)).await??;
    Ok(())
}

#[tokio::test]
async fn closing_the_connection_stops_distribution() -> Result<()> {
    let mut source = MockSource::bind().await?;
    let h = harness(source.url())?;
    let (seen, _subscription) = h.subscribe_point().await?;
    let tasks = h.adapter.spawn();
    let mut peer = source.next_peer(WAIT).await.context("adapter did not connect")?;

    peer.send_json(json!({"timestamp": 6000, "latitude": 6})).await?;
    wait_until(|| !seen.lock().unwrap().is_empty()).await;

    h.adapter.close();
    timeout(WAIT, tasks.distribution).await??;
    timeout(WAIT, tasks.ingest).await???;

    let delivered = seen.lock().unwrap().len();
    sleep(PERIOD * 3).await;
    assert_eq!(seen.lock().unwrap().len(), delivered);
    assert_eq!(h.adapter.state(), ConnectionState::Closed);
    Ok(())
}

#[tokio::test]
async fn unsubscribe_before_first_tick_receives_nothing() -> Result<()> {
    let mut source = MockSource::bind().await?;
    let h = harness(source.url())?;
    let _tasks = h.adapter.spawn();
    let mut peer = source.next_peer(WAIT).await.context("adapter did not connect")?;

    let (cancelled, subscription) = h.subscribe_point().await?;
    subscription.unsubscribe();
    subscription.unsubscribe();
    let (kept, _kept_subscription) = h.subscribe_point().await?;

    peer.send_json(json!({"timestamp": 7000, "latitude": 7})).await?;
    wait_until(|| !kept.lock().unwrap().is_empty()).await;
    sleep(PERIOD * 2).await;

    assert!(cancelled.lock().unwrap().is_empty());
    assert_eq!(h.adapter.multiplexer().active_handles(), 1);
    h.adapter.close();
    Ok(())
}
