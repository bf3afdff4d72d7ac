//! Cross-module scenarios: registry, gateway, orchestrator and bridge
//! working together over shared storage.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::Queue;
use crate::bridge::{
    Delivery, Disposition, InMemoryDeadLetterSink, InMemoryQueue, QueueBridge, TaskMessage,
};
use crate::config::BridgeConfig;
use crate::errors::{ActorflowError, ErrorKind, HandlerFault};
use crate::events::{ChannelEventSink, CollectingEventSink, EventSink};
use crate::gateway::Gateway;
use crate::pipeline::{
    pipeline_kind, PipelineClient, PipelineSpec, PipelineState, PipelineStatus, PipelineStep,
    PIPELINE_NAMESPACE,
};
use crate::registry::{HashRegistry, Registry, UnitIdentity};
use crate::storage::{FileStateStore, InMemoryStateStore, StateStore};
use crate::testing::{counter_kind, echo_kind, RecordingKind};

fn pipeline_gateway(events: Arc<dyn EventSink>, kinds: &[&RecordingKind]) -> Gateway {
    let mut builder = Gateway::builder().register(pipeline_kind(events).unwrap());
    for kind in kinds {
        builder = builder.register(kind.kind().unwrap());
    }
    builder.build().unwrap()
}

#[test]
fn test_wf_42_resolves_identically_across_registries() {
    // Two independent registries stand in for two processes.
    let first = HashRegistry::new().resolve("pipeline", "wf_42").unwrap();
    let second = HashRegistry::new().resolve("pipeline", "wf_42").unwrap();

    assert_eq!(first, second);
    assert_eq!(
        first.id(),
        "ad098dbc2b3dfebae75f0da207c364e6d4fded58bdf44437e28aa78013b65467"
    );
    assert_eq!(UnitIdentity::parse(&first.to_string()).unwrap(), first);
    assert_ne!(first, HashRegistry::new().resolve("pipeline", "wf_43").unwrap());
}

#[tokio::test]
async fn test_fail_fast_scenario_persists_partial_progress() {
    let a = RecordingKind::new("A").succeed("score", serde_json::json!({"score": 10}));
    let b = RecordingKind::new("B").fail("build", HandlerFault::new("quota exceeded"));
    let events = Arc::new(CollectingEventSink::new());
    let client = PipelineClient::new(pipeline_gateway(events.clone(), &[&a, &b]));

    let spec = PipelineSpec::new()
        .step(PipelineStep::new("A", "score"))
        .step(PipelineStep::new("B", "build"));
    let err = client
        .execute_pipeline("wf_42", &spec, serde_json::json!({"x": 1}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PipelineFailed);

    let state = client.status("wf_42").await.unwrap();
    let json = serde_json::to_value(&state).unwrap();
    assert_eq!(json["status"], "failed");
    assert_eq!(json["completed"].as_array().unwrap().len(), 1);
    assert_eq!(json["completed"][0]["step"], "A.score");
    assert_eq!(json["completed"][0]["result"], serde_json::json!({"score": 10}));
    assert_eq!(json["errors"].as_array().unwrap().len(), 1);
    assert_eq!(json["errors"][0]["step"], "B.build");
    assert_eq!(json["errors"][0]["error"], "quota exceeded");

    assert_eq!(
        events.event_types(),
        vec!["pipeline.started", "pipeline.step_completed", "pipeline.failed"]
    );
}

#[tokio::test]
async fn test_three_step_pipeline_stops_at_second_step() {
    let a = RecordingKind::new("A").succeed("one", serde_json::json!(1));
    let b = RecordingKind::new("B").fail("two", HandlerFault::new("boom"));
    let c = RecordingKind::new("C").succeed("three", serde_json::json!(3));
    let client = PipelineClient::new(pipeline_gateway(
        Arc::new(CollectingEventSink::new()),
        &[&a, &b, &c],
    ));

    let spec = PipelineSpec::new()
        .step(PipelineStep::new("A", "one"))
        .step(PipelineStep::new("B", "two"))
        .step(PipelineStep::new("C", "three"));
    let err = client
        .execute_pipeline("wf_3", &spec, serde_json::Value::Null)
        .await
        .unwrap_err();

    let ActorflowError::PipelineFailed { step, state, .. } = err else {
        panic!("expected PipelineFailed, got {err:?}");
    };
    assert_eq!(step, "B.two");
    assert_eq!(state.status, PipelineStatus::Failed);
    assert_eq!(state.completed.len(), 1);
    assert_eq!(state.errors.len(), 1);
    assert_eq!(c.call_count("three"), 0);
}

#[tokio::test]
async fn test_terminal_runs_are_not_reexecuted() {
    let a = RecordingKind::new("A").succeed("score", serde_json::json!({"score": 10}));
    let b = RecordingKind::new("B").fail("build", HandlerFault::new("quota exceeded"));
    let client = PipelineClient::new(pipeline_gateway(
        Arc::new(CollectingEventSink::new()),
        &[&a, &b],
    ));

    let ok = PipelineSpec::new().step(PipelineStep::new("A", "score"));
    let first = client
        .execute_pipeline("wf_ok", &ok, serde_json::Value::Null)
        .await
        .unwrap();
    let second = client
        .execute_pipeline("wf_ok", &ok, serde_json::Value::Null)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(a.call_count("score"), 1);

    let failing = PipelineSpec::new().step(PipelineStep::new("B", "build"));
    for _ in 0..2 {
        let err = client
            .execute_pipeline("wf_bad", &failing, serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(matches!(err, ActorflowError::PipelineFailed { .. }));
    }
    assert_eq!(b.call_count("build"), 1);

    // A retry is a new run under a new logical name.
    client
        .execute_pipeline("wf_bad_retry_1", &failing, serde_json::Value::Null)
        .await
        .unwrap_err();
    assert_eq!(b.call_count("build"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_are_single_flight() {
    let gateway = Gateway::builder().register(counter_kind()).build().unwrap();
    let handle = gateway.resolve("counter", "hot").unwrap();

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let handle = handle.clone();
            // Reads, yields to the scheduler, then writes.
            tokio::spawn(async move { handle.call("increment_slow", serde_json::Value::Null).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state["count"], 50);
    assert_eq!(snapshot.revision, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_calls_run_in_arrival_order() {
    let recorder = RecordingKind::new("journal").echo("push");
    let gateway = Gateway::builder()
        .register(recorder.kind().unwrap())
        .build()
        .unwrap();

    for round in 0..20 {
        recorder.reset();
        let handle = gateway.resolve("journal", &format!("j{round}")).unwrap();
        let calls = (0..64).map(|i| handle.call("push", serde_json::json!(i)));
        for result in futures::future::join_all(calls).await {
            result.unwrap();
        }

        let order: Vec<i64> = recorder
            .calls()
            .iter()
            .map(|c| c.args.as_i64().unwrap())
            .collect();
        assert_eq!(order, (0..64).collect::<Vec<i64>>(), "round {round}");
    }
}

#[tokio::test]
async fn test_counter_is_durable_after_each_call() {
    let store = Arc::new(InMemoryStateStore::new());
    let gateway = Gateway::builder()
        .register(counter_kind())
        .with_store(store.clone())
        .build()
        .unwrap();
    let handle = gateway.resolve("counter", "fresh").unwrap();

    handle.call("increment", serde_json::Value::Null).await.unwrap();
    let stored = store.load(handle.identity()).await.unwrap().unwrap();
    assert_eq!(stored.state["count"], 1);
    assert_eq!(stored.revision, 1);

    handle.call("increment", serde_json::Value::Null).await.unwrap();
    let stored = store.load(handle.identity()).await.unwrap().unwrap();
    assert_eq!(stored.state["count"], 2);
    assert_eq!(stored.revision, 2);
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let gateway = Gateway::builder()
            .register(counter_kind())
            .with_store(Arc::new(FileStateStore::new(dir.path())))
            .build()
            .unwrap();
        let handle = gateway.resolve("counter", "c1").unwrap();
        handle.call("increment", serde_json::Value::Null).await.unwrap();
        handle.call("increment", serde_json::Value::Null).await.unwrap();
    }

    let gateway = Gateway::builder()
        .register(counter_kind())
        .with_store(Arc::new(FileStateStore::new(dir.path())))
        .build()
        .unwrap();
    let handle = gateway.resolve("counter", "c1").unwrap();
    let out = handle.call("get", serde_json::Value::Null).await.unwrap();
    assert_eq!(out["count"], 2);
    assert_eq!(handle.snapshot().await.unwrap().revision, 2);
}

#[tokio::test]
async fn test_second_owner_gets_concurrent_mutation() {
    let store = Arc::new(InMemoryStateStore::new());
    let first = Gateway::builder()
        .register(counter_kind())
        .with_store(store.clone())
        .build()
        .unwrap();
    let second = Gateway::builder()
        .register(counter_kind())
        .with_store(store.clone())
        .build()
        .unwrap();
    let h1 = first.resolve("counter", "shared").unwrap();
    let h2 = second.resolve("counter", "shared").unwrap();

    h1.call("increment", serde_json::Value::Null).await.unwrap();
    h2.call("increment", serde_json::Value::Null).await.unwrap();

    // `first` still holds revision 1 in memory.
    let err = h1
        .call("increment", serde_json::Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrentMutation);
    assert!(err.is_retryable());
    assert_eq!(store.revision(h1.identity()), 2);

    // The stale instance was dropped; the next call reloads ownership.
    let out = h1.call("increment", serde_json::Value::Null).await.unwrap();
    assert_eq!(out["count"], 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_leaves_unit_usable() {
    let gateway = Gateway::builder().register(echo_kind()).build().unwrap();
    let handle = gateway.resolve("echo", "e1").unwrap();

    let err = handle
        .call_with_timeout(
            "sleep",
            serde_json::json!({"ms": 60_000}),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.is_retryable());

    let out = handle
        .call("echo", serde_json::json!({"still": "alive"}))
        .await
        .unwrap();
    assert_eq!(out["still"], "alive");
}

#[tokio::test(start_paused = true)]
async fn test_bridge_retries_three_times_then_dead_letters_once() {
    let flaky = RecordingKind::new("flaky").fail("work", HandlerFault::new("upstream unavailable"));
    let gateway = Gateway::builder()
        .register(flaky.kind().unwrap())
        .build()
        .unwrap();
    let queue = Arc::new(InMemoryQueue::new());
    let dead = Arc::new(InMemoryDeadLetterSink::new());
    let config = BridgeConfig {
        max_retries: 3,
        base_delay_ms: 100,
        max_delay_ms: 10_000,
        ..BridgeConfig::default()
    };
    let bridge = QueueBridge::new(gateway, queue.clone(), dead.clone()).with_config(&config);

    let id = queue
        .send(&TaskMessage::new("flaky", "job-1", "work"))
        .unwrap();

    let mut delays = Vec::new();
    let mut last_errors = Vec::new();
    for _ in 0..10 {
        let deliveries = queue.receive(10).await.unwrap();
        last_errors.extend(deliveries.iter().map(|d| d.last_error.clone()));
        let report = bridge.process_deliveries(deliveries).await;
        for (_, disposition) in &report.outcomes {
            if let Disposition::Retried { delay, .. } = disposition {
                delays.push(*delay);
            }
        }
        if queue.is_drained() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    assert_eq!(flaky.call_count("work"), 4);
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400)
        ]
    );
    assert_eq!(last_errors.len(), 4);
    assert!(last_errors[0].is_none());
    for last in &last_errors[1..] {
        let last = last.as_ref().unwrap();
        assert_eq!(last.kind, ErrorKind::Handler);
        assert!(last.message.contains("upstream unavailable"));
    }
    assert_eq!(dead.len(), 1);
    let letter = &dead.for_message(&id)[0];
    assert_eq!(letter.attempt, 3);
    assert_eq!(letter.error_kind(), ErrorKind::Handler);
    assert_eq!(letter.task.as_ref().unwrap().destination, "job-1");
    assert_eq!(queue.acked(), vec![id]);
}

#[tokio::test]
async fn test_malformed_message_dead_lettered_without_retry() {
    let gateway = Gateway::builder().register(counter_kind()).build().unwrap();
    let queue = Arc::new(InMemoryQueue::new());
    let dead = Arc::new(InMemoryDeadLetterSink::new());
    let bridge = QueueBridge::new(gateway, queue.clone(), dead.clone());

    queue.push(Delivery::new("m-bad", b"{\"namespace\": ".to_vec()));
    let report = bridge.process_batch().await.unwrap();

    assert_eq!(report.dead_lettered(), 1);
    assert_eq!(report.retried(), 0);
    let letter = &dead.letters()[0];
    assert_eq!(letter.error_kind(), ErrorKind::MalformedMessage);
    assert_eq!(letter.attempt, 0);
    assert!(letter.task.is_none());
    assert_eq!(queue.acked(), vec!["m-bad"]);
}

#[tokio::test]
async fn test_bridge_drives_pipelines() {
    let a = RecordingKind::new("A").succeed("score", serde_json::json!({"score": 10}));
    let b = RecordingKind::new("B").fail("build", HandlerFault::new("quota exceeded"));
    let gateway = pipeline_gateway(Arc::new(CollectingEventSink::new()), &[&a, &b]);
    let queue = Arc::new(InMemoryQueue::new());
    let dead = Arc::new(InMemoryDeadLetterSink::new());
    let bridge = QueueBridge::new(gateway.clone(), queue.clone(), dead.clone());

    let ok_spec = PipelineSpec::new().step(PipelineStep::new("A", "score"));
    let bad_spec = ok_spec.clone().step(PipelineStep::new("B", "build"));
    let ok = queue
        .send(
            &TaskMessage::new(PIPELINE_NAMESPACE, "wf_ok", "execute").with_payload(
                serde_json::json!({"run": "wf_ok", "spec": ok_spec, "input": {"x": 1}}),
            ),
        )
        .unwrap();
    let bad = queue
        .send(
            &TaskMessage::new(PIPELINE_NAMESPACE, "wf_bad", "execute").with_payload(
                serde_json::json!({"run": "wf_bad", "spec": bad_spec, "input": {"x": 1}}),
            ),
        )
        .unwrap();

    let report = bridge.process_batch().await.unwrap();
    assert!(matches!(report.disposition(&ok), Some(Disposition::Acked)));
    // A failed pipeline is terminal, so it goes straight to the dead letters.
    assert!(matches!(
        report.disposition(&bad),
        Some(Disposition::DeadLettered { .. })
    ));
    assert_eq!(dead.for_message(&bad).len(), 1);

    let state: PipelineState = PipelineClient::new(gateway).status("wf_bad").await.unwrap();
    assert_eq!(state.status, PipelineStatus::Failed);
    assert_eq!(state.failure().unwrap().error, "quota exceeded");
}

#[tokio::test]
async fn test_completion_event_published_to_channel() {
    let a = RecordingKind::new("A").succeed("score", serde_json::json!({"score": 10}));
    let (sink, mut rx) = ChannelEventSink::new(16);
    let sink = Arc::new(sink);
    let gateway = pipeline_gateway(sink.clone(), &[&a]);
    let client = PipelineClient::new(gateway);

    let spec = PipelineSpec::new().step(PipelineStep::new("A", "score"));
    let result = client
        .execute_pipeline("wf_events", &spec, serde_json::Value::Null)
        .await
        .unwrap();

    let mut records = Vec::new();
    while let Ok(record) = rx.try_recv() {
        records.push(record);
    }
    let types: Vec<&str> = records.iter().map(|r| r.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["pipeline.started", "pipeline.step_completed", "pipeline.completed"]
    );

    let completed = records.last().unwrap();
    assert_eq!(completed.identity, result.identity);
    assert_eq!(
        completed.result.as_ref().unwrap()["A.score"]["score"],
        10
    );
    assert!(completed.error.is_none());
    assert_eq!(sink.metrics().emitted(), 3);
    assert_eq!(sink.metrics().dropped(), 0);
}
