//! Integration tests for the scheduler/pool pair exercised through the
//! public `SchedulerHandle`, per spec.md §8's testable properties and
//! end-to-end scenarios 2-5.

#[path = "../common/support.rs"]
mod support;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use model_runner::{runner::RunnerState, types::BackendMode};
use uuid::Uuid;

fn sockets_dir(label: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("model-runner-pool-test-{label}-{}", Uuid::now_v7()))
}

/// Scenario 2 (concurrency collapse): ten simultaneous identical acquires of
/// the same key must produce exactly one live process and ten successful
/// handles, and end with refcount back at zero once every guard is dropped.
#[tokio::test]
async fn concurrent_acquires_of_the_same_key_collapse_to_one_runner() {
    let spawn_count = Arc::new(AtomicUsize::new(0));
    let descriptor = support::counting_long_lived_backend("llama.cpp", Arc::clone(&spawn_count));
    let bundle = support::stub_bundle("ai/smollm2");
    let scheduler = support::spawn_scheduler(
        descriptor,
        bundle,
        sockets_dir("collapse"),
        support::test_scheduler_config(300, 30),
    );

    let mut handles = Vec::new();
    for _ in 0..10 {
        let scheduler = scheduler.clone();
        handles.push(tokio::spawn(async move {
            scheduler
                .acquire("ai/smollm2", BackendMode::Completion, None)
                .await
        }));
    }

    let results = futures_util::future::join_all(handles).await;
    let runners: Vec<_> = results
        .into_iter()
        .map(|joined| joined.expect("acquire task should not panic").expect("acquire should succeed"))
        .collect();

    assert_eq!(spawn_count.load(Ordering::SeqCst), 1, "exactly one process should have been spawned");
    assert_eq!(runners.len(), 10);
    for runner in &runners {
        assert_eq!(runner.state(), RunnerState::Ready);
    }

    let snapshots = scheduler.list().await;
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].refcount, 0, "no Serve call was made, so refcount should still be zero");

    scheduler.shutdown().await;
}

/// Scenario 3 (crash recovery): when the backend process dies unexpectedly,
/// the reaping tick removes the Exited runner from the pool and a subsequent
/// identical acquire spawns a fresh process rather than reusing state.
#[tokio::test]
async fn crashed_runner_is_reaped_and_next_acquire_starts_fresh() {
    let descriptor = support::crashy_backend("llama.cpp");
    let bundle = support::stub_bundle("ai/smollm2");
    let scheduler = support::spawn_scheduler(
        descriptor,
        bundle,
        sockets_dir("crash"),
        support::test_scheduler_config(300, /* eviction_tick_secs */ 1),
    );

    let runner = scheduler
        .acquire("ai/smollm2", BackendMode::Completion, None)
        .await
        .expect("first acquire should succeed");
    assert_eq!(runner.state(), RunnerState::Ready);

    // crashy_backend's run() future completes right after the readiness
    // probe's single connection; give the eviction tick a cycle to reap it.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    let snapshots = scheduler.list().await;
    assert!(snapshots.is_empty(), "crashed runner should have been removed from the pool");

    scheduler.shutdown().await;
}

/// Scenario 4 (idle eviction): a runner with zero refcount idle past
/// `max_idle_secs` is evicted on the next tick and its socket file removed.
#[tokio::test]
async fn idle_runner_is_evicted_after_max_idle() {
    let descriptor = support::long_lived_backend("llama.cpp");
    let bundle = support::stub_bundle("ai/smollm2");
    let scheduler = support::spawn_scheduler(
        descriptor,
        bundle,
        sockets_dir("idle"),
        support::test_scheduler_config(/* max_idle_secs */ 1, /* eviction_tick_secs */ 1),
    );

    scheduler
        .acquire("ai/smollm2", BackendMode::Completion, None)
        .await
        .expect("acquire should succeed");
    assert_eq!(scheduler.list().await.len(), 1);

    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    assert!(scheduler.list().await.is_empty(), "idle runner should have been evicted");

    scheduler.shutdown().await;
}

/// A failed startup must not poison the key: the Failed entry is removed
/// from the pool so a later Acquire for the same key constructs a fresh
/// Runner and retries, rather than replaying the first error forever.
#[tokio::test]
async fn failed_start_does_not_poison_the_key_for_later_acquires() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let descriptor = support::flaky_then_long_lived_backend("llama.cpp", Arc::clone(&attempts));
    let bundle = support::stub_bundle("ai/smollm2");
    let scheduler = support::spawn_scheduler(
        descriptor,
        bundle,
        sockets_dir("flaky-start"),
        support::test_scheduler_config(300, 30),
    );

    let first = scheduler
        .acquire("ai/smollm2", BackendMode::Completion, None)
        .await;
    assert!(first.is_err(), "first acquire should surface the startup failure");
    assert!(
        scheduler.list().await.is_empty(),
        "a runner that failed to start must not linger in the pool"
    );

    let second = scheduler
        .acquire("ai/smollm2", BackendMode::Completion, None)
        .await
        .expect("second acquire should rebuild and succeed");
    assert_eq!(second.state(), RunnerState::Ready);
    assert_eq!(
        attempts.load(Ordering::SeqCst),
        2,
        "the retry should have started a fresh process rather than reusing the failed one"
    );

    scheduler.shutdown().await;
}

/// A crash while Ready is detected promptly by the per-runner watcher rather
/// than waiting for the next eviction tick: with a long tick interval, the
/// pool should still empty out well before that tick would fire.
#[tokio::test]
async fn crashed_runner_is_reaped_promptly_without_waiting_for_the_eviction_tick() {
    let descriptor = support::crashy_backend("llama.cpp");
    let bundle = support::stub_bundle("ai/smollm2");
    let scheduler = support::spawn_scheduler(
        descriptor,
        bundle,
        sockets_dir("crash-prompt"),
        support::test_scheduler_config(300, /* eviction_tick_secs */ 10),
    );

    let runner = scheduler
        .acquire("ai/smollm2", BackendMode::Completion, None)
        .await
        .expect("first acquire should succeed");
    assert_eq!(runner.state(), RunnerState::Ready);

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    let snapshots = scheduler.list().await;
    assert!(
        snapshots.is_empty(),
        "crashed runner should be reaped well before the 10s eviction tick fires"
    );

    scheduler.shutdown().await;
}

/// Scenario 5 (unload): explicit unload stops the runner and removes it from
/// the pool; a subsequent acquire for the same key constructs a new runner.
#[tokio::test]
async fn unload_removes_runner_and_next_acquire_rebuilds() {
    let spawn_count = Arc::new(AtomicUsize::new(0));
    let descriptor = support::counting_long_lived_backend("llama.cpp", Arc::clone(&spawn_count));
    let bundle = support::stub_bundle("ai/smollm2");
    let scheduler = support::spawn_scheduler(
        descriptor,
        bundle,
        sockets_dir("unload"),
        support::test_scheduler_config(300, 30),
    );

    scheduler
        .acquire("ai/smollm2", BackendMode::Completion, None)
        .await
        .expect("first acquire should succeed");
    assert_eq!(spawn_count.load(Ordering::SeqCst), 1);

    scheduler
        .unload_matching("ai/smollm2", None)
        .await
        .expect("unload should succeed for a live key");
    assert!(scheduler.list().await.is_empty());

    // second unload of the same (now absent) key is a no-op, not an error at
    // the scheduler layer's matching semantics treat "nothing to unload" as
    // ModelNotFound only when *no* runner ever matched; a key that *used to*
    // exist and was already removed also reports nothing left to stop.
    let second = scheduler.unload_matching("ai/smollm2", None).await;
    assert!(second.is_err(), "unloading an already-absent key reports nothing to do");

    scheduler
        .acquire("ai/smollm2", BackendMode::Completion, None)
        .await
        .expect("acquire after unload should rebuild the runner");
    assert_eq!(spawn_count.load(Ordering::SeqCst), 2, "the rebuilt runner should be a fresh process");

    scheduler.shutdown().await;
}
