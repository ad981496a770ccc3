//! Runner pool: the map of live Runners plus per-key waiter queues.
//!
//! This module is deliberately free of locking — it's owned exclusively by
//! the scheduler loop's single task (`crate::scheduler`), which is the only
//! writer, per spec.md §5's "single-writer state machine" design. Treat it
//! like the teacher's `spine/registry.rs` internal map: a plain data
//! structure manipulated synchronously by its one owner.

use std::collections::BTreeMap;

use tokio::sync::oneshot;

use crate::{error::SchedulerError, runner::Runner, types::RunnerKey};

/// A caller waiting for a Runner to become Ready for `key`. Fulfilled exactly
/// once, either with the ready Runner or the error that prevented it.
pub struct Waiter {
    pub responder: oneshot::Sender<Result<std::sync::Arc<Runner>, SchedulerError>>,
}

pub struct PoolEntry {
    pub runner: std::sync::Arc<Runner>,
    /// Requests parked behind this entry's construction. Empty once the
    /// runner reaches Ready or Failed and its waiters have been notified.
    pub waiters: Vec<Waiter>,
}

/// The live set of Runners, keyed by their value-equality fingerprint
/// (spec.md §3 "RunnerKey"). A `BTreeMap` gives a stable iteration order for
/// `/ps` listings without needing a separate sort step.
#[derive(Default)]
pub struct Pool {
    entries: BTreeMap<RunnerKey, PoolEntry>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &RunnerKey) -> Option<&PoolEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &RunnerKey) -> Option<&mut PoolEntry> {
        self.entries.get_mut(key)
    }

    pub fn insert(&mut self, key: RunnerKey, runner: std::sync::Arc<Runner>) {
        self.entries.insert(
            key,
            PoolEntry {
                runner,
                waiters: Vec::new(),
            },
        );
    }

    pub fn remove(&mut self, key: &RunnerKey) -> Option<PoolEntry> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &RunnerKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RunnerKey> {
        self.entries.keys()
    }

    pub fn runners(&self) -> impl Iterator<Item = &std::sync::Arc<Runner>> {
        self.entries.values().map(|entry| &entry.runner)
    }

    /// Keys whose runner has been idle (refcount zero, last used before the
    /// cutoff) and is not exempt from eviction. Passthrough runners are
    /// exempt per the crate's Open-Question resolution in DESIGN.md.
    pub fn idle_candidates(&self, idle_cutoff_unix_secs: u64) -> Vec<RunnerKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| {
                !entry.runner.is_passthrough()
                    && entry.runner.refcount() == 0
                    && entry.runner.snapshot().last_used_unix_secs <= idle_cutoff_unix_secs
                    && entry.runner.state() == crate::runner::RunnerState::Ready
            })
            .map(|(key, _)| key.clone())
            .collect()
    }
}
