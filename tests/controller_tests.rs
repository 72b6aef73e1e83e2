//! Integration tests for the resource controller loop
//!
//! Uses ConfigMaps as the reconciled kind with an in-memory list/watch source.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use k8up_operator::config::ControllerConfig;
use k8up_operator::controller::{
    ControllerBinding, Handler, ListWatch, ObjectKey, ResourceController, WatchEvent,
};
use k8up_operator::metrics;
use k8up_operator::{Error, Result};

use common::{config_map, key, wait_for, Behavior, Calls, TestHandler, TestSource};

fn config(name: &str) -> ControllerConfig {
    ControllerConfig::new(name).with_resync_interval(Duration::from_secs(3600))
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn rejects_invalid_config() {
    let (source, _events) = TestSource::new(&[]);
    let binding = ControllerBinding::new(
        ControllerConfig::new("broken").with_workers(0),
        source,
        TestHandler::new(Calls::default(), Behavior::Succeed),
    );

    assert!(matches!(
        ResourceController::new(binding),
        Err(Error::Config(_))
    ));
}

#[tokio::test]
async fn initial_list_failure_is_reported() {
    let binding = ControllerBinding::new(
        config("restore"),
        TestSource::failing(),
        TestHandler::new(Calls::default(), Behavior::Succeed),
    );
    let controller = ResourceController::new(binding).unwrap();

    let err = controller.run(CancellationToken::new()).await.unwrap_err();
    match err {
        Error::InitialList { controller, .. } => assert_eq!(controller, "restore"),
        other => panic!("unexpected error: {other}"),
    }
}

// ============================================================================
// Resync
// ============================================================================

#[tokio::test(start_paused = true)]
async fn resync_reconciles_each_record_once_per_interval() {
    let (source, _events) = TestSource::new(&["a", "b", "c"]);
    let calls = Calls::default();
    let binding = ControllerBinding::new(
        ControllerConfig::new("backup")
            .with_resync_interval(Duration::from_secs(1))
            .with_workers(1),
        source,
        TestHandler::new(calls.clone(), Behavior::Succeed),
    );
    let controller = ResourceController::new(binding).unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(controller.run(shutdown.clone()));

    wait_for(|| calls.total() == 3).await;
    for name in ["a", "b", "c"] {
        assert_eq!(calls.count(name), 1);
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    for name in ["a", "b", "c"] {
        assert_eq!(calls.count(name), 2, "record {name} after one resync");
    }

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn failing_item_is_retried_then_dropped() {
    let (source, events) = TestSource::new(&["a"]);
    let calls = Calls::default();
    let binding = ControllerBinding::new(
        config("backup").with_max_retries(5),
        source,
        TestHandler::new(calls.clone(), Behavior::Fail),
    );
    let controller = ResourceController::new(binding).unwrap();
    let queue = controller.queue();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(controller.run(shutdown.clone()));

    wait_for(|| calls.count("a") == 6).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.count("a"), 6, "one attempt plus five retries");
    assert_eq!(queue.retries(&key("a")), 0);
    assert!(queue.is_empty());

    // A fresh notification starts a new retry cycle
    events
        .unbounded_send(Ok(WatchEvent::Applied(config_map("a"))))
        .unwrap();
    wait_for(|| calls.count("a") == 12).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.count("a"), 12);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn zero_retries_means_single_attempt() {
    let (source, _events) = TestSource::new(&["a"]);
    let calls = Calls::default();
    let binding = ControllerBinding::new(
        config("check").with_max_retries(0),
        source,
        TestHandler::new(calls.clone(), Behavior::Fail),
    );
    let controller = ResourceController::new(binding).unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(controller.run(shutdown.clone()));

    wait_for(|| calls.count("a") == 1).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.count("a"), 1);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn permanent_errors_are_not_retried() {
    let (source, _events) = TestSource::new(&["a"]);
    let calls = Calls::default();
    let binding = ControllerBinding::new(
        config("prune").with_max_retries(5),
        source,
        TestHandler::new(calls.clone(), Behavior::FailPermanently),
    );
    let controller = ResourceController::new(binding).unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(controller.run(shutdown.clone()));

    wait_for(|| calls.count("a") == 1).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.count("a"), 1);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

// ============================================================================
// Isolation
// ============================================================================

/// Panics for records named `bad`, succeeds otherwise
struct SelectivePanic {
    calls: Calls,
}

#[async_trait]
impl Handler<ConfigMap> for SelectivePanic {
    async fn reconcile(&self, obj: Arc<ConfigMap>) -> Result<()> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.calls.record(&name);
        if name == "bad" {
            panic!("cannot handle {name}");
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_record_does_not_affect_others() {
    let (source, events) = TestSource::new(&["bad", "good"]);
    let calls = Calls::default();
    let binding = ControllerBinding::new(
        config("archive").with_max_retries(2),
        source,
        SelectivePanic {
            calls: calls.clone(),
        },
    );
    let controller = ResourceController::new(binding).unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(controller.run(shutdown.clone()));

    wait_for(|| calls.count("bad") == 3 && calls.count("good") == 1).await;

    events
        .unbounded_send(Ok(WatchEvent::Applied(config_map("good"))))
        .unwrap();
    wait_for(|| calls.count("good") == 2).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.count("bad"), 3);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

/// Tracks how many reconciles run at once, per key and overall
#[derive(Default)]
struct ConcurrencyProbe {
    in_flight: Mutex<HashMap<String, usize>>,
    max_per_key: AtomicUsize,
    current: AtomicUsize,
    max_total: AtomicUsize,
    calls: AtomicUsize,
}

struct ProbeHandler(Arc<ConcurrencyProbe>);

#[async_trait]
impl Handler<ConfigMap> for ProbeHandler {
    async fn reconcile(&self, obj: Arc<ConfigMap>) -> Result<()> {
        let probe = &self.0;
        let name = obj.metadata.name.clone().unwrap_or_default();
        {
            let mut in_flight = probe.in_flight.lock();
            let count = in_flight.entry(name.clone()).or_insert(0);
            *count += 1;
            probe.max_per_key.fetch_max(*count, Ordering::SeqCst);
        }
        let now = probe.current.fetch_add(1, Ordering::SeqCst) + 1;
        probe.max_total.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(20)).await;

        probe.current.fetch_sub(1, Ordering::SeqCst);
        *probe.in_flight.lock().get_mut(&name).unwrap() -= 1;
        probe.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_key_is_never_reconciled_concurrently() {
    let (source, events) = TestSource::new(&["a", "b"]);
    let probe = Arc::new(ConcurrencyProbe::default());
    let binding = ControllerBinding::new(
        config("backup").with_workers(4),
        source,
        ProbeHandler(probe.clone()),
    );
    let controller = ResourceController::new(binding).unwrap();
    let queue = controller.queue();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(controller.run(shutdown.clone()));

    for _ in 0..20 {
        for name in ["a", "b"] {
            events
                .unbounded_send(Ok(WatchEvent::Applied(config_map(name))))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    wait_for(|| probe.calls.load(Ordering::SeqCst) >= 4 && queue.is_empty()).await;
    wait_for(|| probe.current.load(Ordering::SeqCst) == 0).await;

    assert_eq!(probe.max_per_key.load(Ordering::SeqCst), 1);
    assert!(probe.max_total.load(Ordering::SeqCst) >= 2);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

// ============================================================================
// Deletion and shutdown
// ============================================================================

#[tokio::test]
async fn deleted_records_are_cleaned_up() {
    let (source, events) = TestSource::new(&["a"]);
    let calls = Calls::default();
    let handler = TestHandler::new(calls.clone(), Behavior::Succeed);
    let cleanups = handler.cleanups.clone();
    let controller =
        ResourceController::new(ControllerBinding::new(config("restore"), source, handler))
            .unwrap();
    let store = controller.store();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(controller.run(shutdown.clone()));

    wait_for(|| calls.count("a") == 1).await;
    assert!(store.get(&key("a")).is_some());

    events
        .unbounded_send(Ok(WatchEvent::Deleted(config_map("a"))))
        .unwrap();
    wait_for(|| !cleanups.lock().is_empty()).await;

    assert_eq!(cleanups.lock().as_slice(), &[key("a")]);
    assert!(store.get(&key("a")).is_none());
    assert_eq!(calls.count("a"), 1);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn triggers_queue_known_records() {
    let (source, _events) = TestSource::new(&["a"]);
    let calls = Calls::default();
    let (tx, rx) = futures::channel::mpsc::unbounded::<ObjectKey>();
    let binding = ControllerBinding::new(
        config("backup"),
        source,
        TestHandler::new(calls.clone(), Behavior::Succeed),
    )
    .with_triggers(Box::pin(rx));
    let controller = ResourceController::new(binding).unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(controller.run(shutdown.clone()));

    wait_for(|| calls.count("a") == 1).await;
    tx.unbounded_send(key("a")).unwrap();
    wait_for(|| calls.count("a") == 2).await;

    // Closing the trigger stream leaves the controller running
    drop(tx);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn relisting_prunes_records_deleted_while_disconnected() {
    let (source, events) = TestSource::new(&["a", "b"]);
    let calls = Calls::default();
    let handler = TestHandler::new(calls.clone(), Behavior::Succeed);
    let cleanups = handler.cleanups.clone();
    let binding = ControllerBinding::new(
        ControllerConfig::new("restore").with_resync_interval(Duration::from_millis(50)),
        source,
        handler,
    );
    let controller = ResourceController::new(binding).unwrap();
    let store = controller.store();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(controller.run(shutdown.clone()));

    wait_for(|| calls.count("a") >= 1 && calls.count("b") >= 1).await;

    // `b` was deleted while the watch was down; the re-list no longer has it
    events
        .unbounded_send(Ok(WatchEvent::Restarted(vec![config_map("a")])))
        .unwrap();
    wait_for(|| !cleanups.lock().is_empty()).await;

    assert_eq!(cleanups.lock().as_slice(), &[key("b")]);
    assert!(store.get(&key("b")).is_none());
    assert!(store.get(&key("a")).is_some());

    let b_calls = calls.count("b");
    let a_calls = calls.count("a");
    wait_for(|| calls.count("a") >= a_calls + 2).await;
    assert_eq!(calls.count("b"), b_calls, "resync must not revive a pruned record");
    assert_eq!(cleanups.lock().len(), 1);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

/// Source whose watch always has another event ready
struct BusyWatch;

#[async_trait]
impl ListWatch<ConfigMap> for BusyWatch {
    async fn list(&self) -> Result<Vec<ConfigMap>> {
        Ok(vec![config_map("a")])
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<ConfigMap>>> {
        stream::repeat_with(|| Ok(WatchEvent::Applied(config_map("busy")))).boxed()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn busy_watch_does_not_starve_resync() {
    let binding = ControllerBinding::new(
        ControllerConfig::new("busy-watch").with_resync_interval(Duration::from_millis(50)),
        BusyWatch,
        TestHandler::new(Calls::default(), Behavior::Succeed),
    );
    let controller = ResourceController::new(binding).unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(controller.run(shutdown.clone()));

    let resyncs = || metrics::RESYNCS.with_label_values(&["busy-watch"]).get();
    wait_for(|| resyncs() >= 2.0).await;

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

/// Slow handler recording whether its reconcile ran to completion
struct Slow {
    started: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl Handler<ConfigMap> for Slow {
    async fn reconcile(&self, _obj: Arc<ConfigMap>) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn stop_waits_for_in_flight_reconcile() {
    let (source, _events) = TestSource::new(&["a"]);
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let binding = ControllerBinding::new(
        config("backup"),
        source,
        Slow {
            started: started.clone(),
            finished: finished.clone(),
        },
    );
    let controller = ResourceController::new(binding).unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(controller.run(shutdown.clone()));

    wait_for(|| started.load(Ordering::SeqCst)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert!(finished.load(Ordering::SeqCst));
}
