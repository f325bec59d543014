//! Integration test: stream pipeline over in-memory channels and sinks.

use fraud_ensemble::{
    config::{AppConfig, PipelineConfig},
    dispatch::{Dispatcher, ResultSink},
    ensemble::Ensemble,
    metrics::PipelineMetrics,
    pipeline::StreamPipeline,
    store::ResultStore,
    testing::{
        event_channel, memory_events, record_json, slow_registry, stub_ensemble, stub_registry,
        AckLedger, FailingSink, MemorySink,
    },
    TransactionRecord,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn pipeline_config(workers: usize, timeout_ms: u64) -> PipelineConfig {
    PipelineConfig {
        workers,
        timeout_ms,
        ..AppConfig::default().pipeline
    }
}

fn build(
    ensemble: Ensemble,
    sinks: Vec<Arc<dyn ResultSink>>,
    config: &PipelineConfig,
) -> StreamPipeline {
    StreamPipeline::new(
        Arc::new(ensemble),
        Dispatcher::new(sinks),
        Arc::new(PipelineMetrics::new()),
        config,
    )
}

fn payload(seed: u64) -> Vec<u8> {
    serde_json::to_vec(&record_json(seed)).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn thousand_events_match_sequential_scoring() {
    let sink = Arc::new(MemorySink::new("memory"));
    let pipeline = build(
        stub_ensemble(stub_registry()),
        vec![sink.clone() as Arc<dyn ResultSink>],
        &pipeline_config(16, 5_000),
    );
    let ledger = AckLedger::new();

    let payloads: Vec<Vec<u8>> = (0..1000).map(payload).collect();
    let (_tx, shutdown) = watch::channel(false);
    let summary = pipeline.run(memory_events(payloads, &ledger), shutdown).await;

    assert_eq!(summary.received, 1000);
    assert_eq!(summary.dispatched, 1000);
    assert_eq!(ledger.acked(), 1000);

    let reference = stub_ensemble(stub_registry());
    let expected: BTreeMap<String, u64> = (0..1000)
        .map(|seed| {
            let record = TransactionRecord::from_json_value(&record_json(seed)).unwrap();
            let result = reference.evaluate(&record).unwrap();
            (result.transaction_id, result.fraud_probability.to_bits())
        })
        .collect();
    let actual: BTreeMap<String, u64> = sink
        .results()
        .into_iter()
        .map(|r| (r.transaction_id, r.fraud_probability.to_bits()))
        .collect();

    assert_eq!(expected, actual);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_drains_in_flight_events() {
    let sink = Arc::new(MemorySink::new("memory"));
    let pipeline = build(
        stub_ensemble(slow_registry(Duration::from_millis(100))),
        vec![sink.clone() as Arc<dyn ResultSink>],
        &pipeline_config(4, 2_000),
    );
    let ledger = AckLedger::new();
    let (events_tx, events) = event_channel(&ledger);
    let (shutdown_tx, shutdown) = watch::channel(false);

    for seed in 0..4 {
        events_tx.unbounded_send(payload(seed)).unwrap();
    }
    let running = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.run(events, shutdown).await }
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    shutdown_tx.send(true).unwrap();
    for seed in 4..8 {
        // Ignored once the pipeline has stopped and dropped its receiver
        let _ = events_tx.unbounded_send(payload(seed));
    }

    let summary = running.await.unwrap();
    assert_eq!(summary.received, 4);
    assert_eq!(summary.dispatched, 4);
    assert_eq!(ledger.acked(), 4);
    assert_eq!(sink.results().len(), 4);
}

#[tokio::test]
async fn dispatch_failures_do_not_fail_events() {
    let memory = Arc::new(MemorySink::new("memory"));
    let metrics = Arc::new(PipelineMetrics::new());
    let pipeline = StreamPipeline::new(
        Arc::new(stub_ensemble(stub_registry())),
        Dispatcher::new(vec![
            Arc::new(FailingSink::new("nats")) as Arc<dyn ResultSink>,
            memory.clone() as Arc<dyn ResultSink>,
        ])
        .with_metrics(metrics.clone()),
        metrics.clone(),
        &pipeline_config(2, 1_000),
    );
    let ledger = AckLedger::new();

    let (_tx, shutdown) = watch::channel(false);
    let summary = pipeline
        .run(memory_events((0..5).map(payload).collect(), &ledger), shutdown)
        .await;

    assert_eq!(summary.dispatched, 5);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.sink_failures, 5);
    assert_eq!(ledger.acked(), 5);
    assert_eq!(memory.results().len(), 5);
    assert_eq!(metrics.get_dispatch_failures()["nats"], 5);
}

#[tokio::test]
async fn results_are_persisted_to_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.jsonl");
    let store = Arc::new(ResultStore::open(&path).await.unwrap());
    let pipeline = build(
        stub_ensemble(stub_registry()),
        vec![store as Arc<dyn ResultSink>],
        &pipeline_config(4, 1_000),
    );
    let ledger = AckLedger::new();

    let payloads = vec![payload(1), b"{\"amount\": 3}".to_vec(), payload(2)];
    let (_tx, shutdown) = watch::channel(false);
    let summary = pipeline.run(memory_events(payloads, &ledger), shutdown).await;

    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(ledger.acked(), 3);

    let mut ids: Vec<String> = ResultStore::read_all(&path)
        .await
        .unwrap()
        .into_iter()
        .map(|stored| stored.result.transaction_id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["tx_000001", "tx_000002"]);
}
