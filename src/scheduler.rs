//! Scheduler loop: the single task that owns `Pool` mutation (spec.md §4.5).
//!
//! All state transitions — starting a new Runner, settling waiters, releasing
//! a reference, unloading a key, reaping a crashed process, evicting an idle
//! one — funnel through the `Command` channel so there is exactly one writer.
//! Callers talk to `SchedulerHandle`, a cheap `Clone` wrapper around the
//! sender, mirroring the teacher's `spine/adapters/unix_socket.rs` broker
//! pattern (command channel + oneshot replies + background tasks that report
//! their own completion back in).

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    bundle::{BundleResolver, ResolvedTarget},
    error::{SchedulerError, upstream_error},
    install::InstallCoordinator,
    pool::Pool,
    runner::{Runner, RunnerTimings},
    types::RunnerKey,
};

pub type RunnerResult = Result<Arc<Runner>, SchedulerError>;

enum Command {
    Acquire {
        model_ref: String,
        mode: crate::types::BackendMode,
        backend_hint: Option<String>,
        responder: oneshot::Sender<RunnerResult>,
    },
    AcquireSettled {
        key: RunnerKey,
        result: Result<(), SchedulerError>,
    },
    Unload {
        key: RunnerKey,
        responder: oneshot::Sender<Result<(), SchedulerError>>,
    },
    UnloadMatching {
        model_ref: String,
        backend_hint: Option<String>,
        responder: oneshot::Sender<Result<(), SchedulerError>>,
    },
    RunnerStopped {
        key: RunnerKey,
    },
    RunnerCrashed {
        key: RunnerKey,
    },
    List {
        responder: oneshot::Sender<Vec<crate::runner::RunnerSnapshot>>,
    },
    ListKeysInternal {
        responder: oneshot::Sender<Vec<RunnerKey>>,
    },
    EvictTick,
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Resolves `model_ref`/`mode` to a Runner, constructing and starting one
    /// if none exists yet for the resulting key, and waiting behind an
    /// in-flight construction if one is already underway (spec.md §4.5
    /// "at most one concurrent Start per key").
    pub async fn acquire(
        &self,
        model_ref: impl Into<String>,
        mode: crate::types::BackendMode,
        backend_hint: Option<String>,
    ) -> RunnerResult {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Command::Acquire {
                model_ref: model_ref.into(),
                mode,
                backend_hint,
                responder,
            })
            .await
            .map_err(|_| upstream_error("scheduler loop is no longer running"))?;
        receiver
            .await
            .map_err(|_| upstream_error("scheduler loop dropped the acquire response"))?
    }

    pub async fn unload(&self, key: RunnerKey) -> Result<(), SchedulerError> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Command::Unload { key, responder })
            .await
            .map_err(|_| upstream_error("scheduler loop is no longer running"))?;
        receiver
            .await
            .map_err(|_| upstream_error("scheduler loop dropped the unload response"))?
    }

    /// Unloads every currently-listed key. Not a primitive `Command` of its
    /// own — composed from `list()` + concurrent `unload()` calls, since each
    /// key's drain/stop is independent.
    pub async fn unload_all(&self) -> Vec<Result<(), SchedulerError>> {
        let keys = self.list_keys().await;
        futures_util::future::join_all(keys.into_iter().map(|key| self.unload(key))).await
    }

    /// Unloads every Runner matching a model reference (and, if given, a
    /// backend). Callers (the HTTP `/unload` handler) only know the model
    /// reference and an optional backend name — not the full `RunnerKey`,
    /// whose `config_hash` is an internal fingerprinting detail — so the
    /// matching happens inside the scheduler loop where the full keys live.
    pub async fn unload_matching(
        &self,
        model_ref: impl Into<String>,
        backend_hint: Option<String>,
    ) -> Result<(), SchedulerError> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Command::UnloadMatching {
                model_ref: model_ref.into(),
                backend_hint,
                responder,
            })
            .await
            .map_err(|_| upstream_error("scheduler loop is no longer running"))?;
        receiver
            .await
            .map_err(|_| upstream_error("scheduler loop dropped the unload response"))?
    }

    pub async fn list(&self) -> Vec<crate::runner::RunnerSnapshot> {
        let (responder, receiver) = oneshot::channel();
        if self.sender.send(Command::List { responder }).await.is_err() {
            return Vec::new();
        }
        receiver.await.unwrap_or_default()
    }

    async fn list_keys(&self) -> Vec<RunnerKey> {
        let (responder, receiver) = oneshot::channel();
        if self
            .sender
            .send(Command::ListKeysInternal { responder })
            .await
            .is_err()
        {
            return Vec::new();
        }
        receiver.await.unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        let (responder, receiver) = oneshot::channel();
        if self.sender.send(Command::Shutdown { responder }).await.is_ok() {
            let _ = receiver.await;
        }
    }
}

pub struct SchedulerConfig {
    pub timings: RunnerTimings,
    pub eviction_tick: Duration,
    pub max_idle_secs: u64,
    pub max_runners: usize,
}

/// Spawns the scheduler loop task and returns a handle to it. The loop runs
/// until `shutdown()` is called or the handle is fully dropped.
pub fn spawn(
    resolver: Arc<BundleResolver>,
    install: Arc<InstallCoordinator>,
    config: SchedulerConfig,
    shutdown_token: CancellationToken,
) -> SchedulerHandle {
    let (sender, receiver) = mpsc::channel(256);
    let handle = SchedulerHandle { sender: sender.clone() };
    tokio::spawn(run_loop(
        receiver,
        sender,
        resolver,
        install,
        config,
        shutdown_token,
    ));
    handle
}

async fn run_loop(
    mut receiver: mpsc::Receiver<Command>,
    sender: mpsc::Sender<Command>,
    resolver: Arc<BundleResolver>,
    install: Arc<InstallCoordinator>,
    config: SchedulerConfig,
    shutdown_token: CancellationToken,
) {
    let mut pool = Pool::new();
    let mut ticker = tokio::time::interval(config.eviction_tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _ = sender.try_send(Command::EvictTick);
            }
            command = receiver.recv() => {
                match command {
                    Some(Command::Acquire { model_ref, mode, backend_hint, responder }) => {
                        handle_acquire(
                            &mut pool,
                            &resolver,
                            &install,
                            &sender,
                            &config,
                            model_ref,
                            mode,
                            backend_hint,
                            responder,
                        )
                        .await;
                    }
                    Some(Command::AcquireSettled { key, result }) => {
                        handle_acquire_settled(&mut pool, key, result);
                    }
                    Some(Command::Unload { key, responder }) => {
                        handle_unload(&mut pool, &sender, &config, key, responder);
                    }
                    Some(Command::UnloadMatching { model_ref, backend_hint, responder }) => {
                        handle_unload_matching(&mut pool, &sender, &config, model_ref, backend_hint, responder);
                    }
                    Some(Command::RunnerStopped { key }) => {
                        pool.remove(&key);
                        info!(runner = %key, "runner removed from pool");
                    }
                    Some(Command::RunnerCrashed { key }) => {
                        reap_one(&mut pool, &sender, key).await;
                    }
                    Some(Command::List { responder }) => {
                        let snapshots = pool.runners().map(|r| r.snapshot()).collect();
                        let _ = responder.send(snapshots);
                    }
                    Some(Command::ListKeysInternal { responder }) => {
                        let keys = pool.keys().cloned().collect();
                        let _ = responder.send(keys);
                    }
                    Some(Command::EvictTick) => {
                        evict_idle(&mut pool, &sender, &config);
                        reap_crashed(&mut pool, &sender).await;
                    }
                    Some(Command::Shutdown { responder }) => {
                        shutdown_token.cancel();
                        let keys: Vec<RunnerKey> = pool.keys().cloned().collect();
                        let runners: Vec<Arc<Runner>> = keys
                            .into_iter()
                            .filter_map(|key| pool.remove(&key).map(|entry| entry.runner))
                            .collect();
                        let timings = config.timings;
                        futures_util::future::join_all(
                            runners.iter().map(|runner| runner.stop(timings)),
                        )
                        .await;
                        let _ = responder.send(());
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_acquire(
    pool: &mut Pool,
    resolver: &Arc<BundleResolver>,
    install: &Arc<InstallCoordinator>,
    sender: &mpsc::Sender<Command>,
    config: &SchedulerConfig,
    model_ref: String,
    mode: crate::types::BackendMode,
    backend_hint: Option<String>,
    responder: oneshot::Sender<RunnerResult>,
) {
    let resolved = match resolver.resolve(&model_ref, mode, backend_hint.as_deref()).await {
        Ok(resolved) => resolved,
        Err(err) => {
            let _ = responder.send(Err(err));
            return;
        }
    };

    let ResolvedTarget {
        key,
        descriptor,
        bundle,
        config: runner_config,
        socket_path,
        remote_base_url,
    } = resolved;

    if let Some(entry) = pool.get_mut(&key) {
        match entry.runner.state() {
            crate::runner::RunnerState::Ready => {
                let _ = responder.send(Ok(Arc::clone(&entry.runner)));
            }
            crate::runner::RunnerState::Failed | crate::runner::RunnerState::Exited => {
                let err = entry
                    .runner
                    .snapshot()
                    .first_error
                    .unwrap_or_else(|| upstream_error("runner previously failed"));
                let _ = responder.send(Err(err));
            }
            _ => entry.waiters.push(crate::pool::Waiter { responder }),
        }
        return;
    }

    if config.max_runners > 0 && pool.len() >= config.max_runners {
        let _ = responder.send(Err(crate::error::startup_failed(
            "runner pool is at max_runners capacity",
        )));
        return;
    }

    let runner = Arc::new(Runner::new(
        key.clone(),
        descriptor,
        bundle,
        mode,
        runner_config,
        socket_path,
        remote_base_url,
    ));
    pool.insert(key.clone(), Arc::clone(&runner));
    if let Some(entry) = pool.get_mut(&key) {
        entry.waiters.push(crate::pool::Waiter { responder });
    }

    let install = Arc::clone(install);
    let sender = sender.clone();
    let timings = config.timings;
    let started_runner = Arc::clone(&runner);
    let started_key = key.clone();
    tokio::spawn(async move {
        let result = started_runner.start(&install, timings).await;
        let started_ok = result.is_ok();
        let _ = sender
            .send(Command::AcquireSettled {
                key: started_key.clone(),
                result,
            })
            .await;
        if started_ok {
            watch_for_crash(started_runner, started_key, sender).await;
        }
    });
}

fn handle_acquire_settled(pool: &mut Pool, key: RunnerKey, result: Result<(), SchedulerError>) {
    let Some(entry) = pool.get_mut(&key) else {
        return;
    };
    let waiters = std::mem::take(&mut entry.waiters);
    match &result {
        Ok(()) => {
            info!(runner = %key, "runner ready");
            for waiter in waiters {
                // refcount is owned entirely by `Runner::serve`'s drop guard
                // (DESIGN.md); a waiter just receives the handle and calls
                // `serve` itself, which bumps the count on entry.
                let _ = waiter.responder.send(Ok(Arc::clone(&entry.runner)));
            }
        }
        Err(err) => {
            error!(runner = %key, error = %err, "runner failed to start");
            for waiter in waiters {
                let _ = waiter.responder.send(Err(err.clone()));
            }
            // A startup failure must not poison the key: remove the Failed
            // entry so the next Acquire constructs a fresh Runner instead of
            // replaying this error forever (spec.md §7/§3/§4.4).
            pool.remove(&key);
        }
    }
}

fn handle_unload(
    pool: &mut Pool,
    sender: &mpsc::Sender<Command>,
    config: &SchedulerConfig,
    key: RunnerKey,
    responder: oneshot::Sender<Result<(), SchedulerError>>,
) {
    let Some(entry) = pool.get(&key) else {
        let _ = responder.send(Ok(()));
        return;
    };
    let runner = Arc::clone(&entry.runner);
    let sender = sender.clone();
    let timings = config.timings;
    let stopped_key = key.clone();
    tokio::spawn(async move {
        runner.stop(timings).await;
        let _ = sender
            .send(Command::RunnerStopped { key: stopped_key })
            .await;
        let _ = responder.send(Ok(()));
    });
}

fn handle_unload_matching(
    pool: &mut Pool,
    sender: &mpsc::Sender<Command>,
    config: &SchedulerConfig,
    model_ref: String,
    backend_hint: Option<String>,
    responder: oneshot::Sender<Result<(), SchedulerError>>,
) {
    let matching: Vec<RunnerKey> = pool
        .keys()
        .filter(|key| {
            key.model_ref == model_ref
                && backend_hint.as_deref().is_none_or(|hint| hint == key.backend)
        })
        .cloned()
        .collect();

    if matching.is_empty() {
        let _ = responder.send(Err(crate::error::model_not_found(format!(
            "no live runner for model {model_ref}"
        ))));
        return;
    }

    let mut runners = Vec::with_capacity(matching.len());
    for key in matching {
        if let Some(entry) = pool.remove(&key) {
            runners.push((key, entry.runner));
        }
    }

    let sender = sender.clone();
    let timings = config.timings;
    tokio::spawn(async move {
        for (key, runner) in runners {
            runner.stop(timings).await;
            let _ = sender.send(Command::RunnerStopped { key }).await;
        }
        let _ = responder.send(Ok(()));
    });
}

fn evict_idle(pool: &mut Pool, sender: &mpsc::Sender<Command>, config: &SchedulerConfig) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let cutoff = now.saturating_sub(config.max_idle_secs);
    for key in pool.idle_candidates(cutoff) {
        if let Some(entry) = pool.remove(&key) {
            let runner = entry.runner;
            let sender = sender.clone();
            let timings = config.timings;
            let evicted_key = key.clone();
            tokio::spawn(async move {
                warn!(runner = %evicted_key, "evicting idle runner");
                runner.stop(timings).await;
                let _ = sender
                    .send(Command::RunnerStopped { key: evicted_key })
                    .await;
            });
        }
    }
}

async fn reap_crashed(pool: &mut Pool, sender: &mpsc::Sender<Command>) {
    let mut crashed = Vec::new();
    for key in pool.keys().cloned().collect::<Vec<_>>() {
        if let Some(entry) = pool.get(&key)
            && entry.runner.crashed().await
        {
            crashed.push(key);
        }
    }
    for key in crashed {
        reap_one(pool, sender, key).await;
    }
}

/// Removes a single crashed entry from the pool, if it's still there and
/// still crashed — a concurrent Unload/evict may already have taken care of
/// it by the time this runs. Shared by the periodic eviction-tick sweep and
/// the per-runner crash watcher spawned in `handle_acquire` (spec.md §4.3
/// "the runner transitions to Exited and is removed").
async fn reap_one(pool: &mut Pool, sender: &mpsc::Sender<Command>, key: RunnerKey) {
    let Some(entry) = pool.get(&key) else {
        return;
    };
    if !entry.runner.crashed().await {
        return;
    }
    if let Some(entry) = pool.remove(&key) {
        entry.runner.mark_crashed();
        error!(runner = %key, "reaped crashed runner");
    }
    let _ = sender.send(Command::RunnerStopped { key }).await;
}

/// Polls a freshly-Ready runner for an unexpected process exit and reports it
/// to the scheduler loop immediately, instead of waiting for the next
/// `EvictTick` (spec.md §8 invariant 3: a Ready runner has a live
/// subprocess). Stops polling once the runner leaves Ready through a normal
/// drain/stop, since that path already reports its own removal.
async fn watch_for_crash(runner: Arc<Runner>, key: RunnerKey, sender: mpsc::Sender<Command>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if runner.state() != crate::runner::RunnerState::Ready {
            return;
        }
        if runner.crashed().await {
            let _ = sender.send(Command::RunnerCrashed { key }).await;
            return;
        }
    }
}
