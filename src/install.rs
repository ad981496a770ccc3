//! Install coordinator: at most one concurrent `Install` per backend name,
//! memoized until a failure resets the gate (spec.md §4.2).
//!
//! Each backend gets its own `tokio::sync::Mutex`-guarded gate so that
//! installing one backend never blocks a concurrent install of another —
//! only per-backend serialization is guaranteed, matching the spec's
//! "the coordinator just ensures per-backend serialization, not cross-backend".

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use tokio::sync::{Mutex, Notify};

use crate::{
    error::SchedulerError,
    registry::{BackendDescriptor, InstallContext},
    types::BackendId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Uninstalled,
    Installing,
    Installed,
}

struct Gate {
    state: Mutex<GateState>,
    notify: Notify,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            state: Mutex::new(GateState::Uninstalled),
            notify: Notify::new(),
        }
    }
}

pub struct InstallCoordinator {
    work_dir: PathBuf,
    gates: std::sync::RwLock<BTreeMap<BackendId, Arc<Gate>>>,
}

impl InstallCoordinator {
    pub fn new(work_dir: PathBuf) -> Self {
        Self {
            work_dir,
            gates: std::sync::RwLock::new(BTreeMap::new()),
        }
    }

    fn gate_for(&self, backend: &str) -> Arc<Gate> {
        if let Some(gate) = self.gates.read().expect("install lock poisoned").get(backend) {
            return Arc::clone(gate);
        }
        let mut guard = self.gates.write().expect("install lock poisoned");
        Arc::clone(
            guard
                .entry(backend.to_string())
                .or_insert_with(|| Arc::new(Gate::default())),
        )
    }

    /// A backend marked `deferred` skips this at startup; its gate only fires
    /// on the first `Acquire` that needs it, via this same method.
    pub async fn ensure_installed(
        &self,
        descriptor: &BackendDescriptor,
    ) -> Result<(), SchedulerError> {
        if descriptor.is_passthrough {
            return Ok(());
        }

        let gate = self.gate_for(&descriptor.name);
        loop {
            let mut state = gate.state.lock().await;
            match *state {
                GateState::Installed => return Ok(()),
                GateState::Installing => {
                    drop(state);
                    gate.notify.notified().await;
                    continue;
                }
                GateState::Uninstalled => {
                    *state = GateState::Installing;
                    drop(state);

                    let ctx = InstallContext {
                        backend: descriptor.name.clone(),
                        work_dir: self.work_dir.clone(),
                    };
                    let result = (descriptor.install)(ctx).await;

                    let mut state = gate.state.lock().await;
                    *state = match &result {
                        Ok(()) => GateState::Installed,
                        Err(_) => GateState::Uninstalled,
                    };
                    drop(state);
                    gate.notify.notify_waiters();
                    return result;
                }
            }
        }
    }

    /// Forces the next `ensure_installed` call to re-run install, used when a
    /// backend binary is upgraded out from under a running service.
    pub async fn invalidate(&self, backend: &str) {
        let gate = self.gate_for(backend);
        let mut state = gate.state.lock().await;
        *state = GateState::Uninstalled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackendMode, BundleFormat};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_descriptor(name: &str, counter: Arc<AtomicUsize>, fail: bool) -> BackendDescriptor {
        BackendDescriptor {
            name: name.to_string(),
            deferred: false,
            is_passthrough: false,
            supported_modes: &[BackendMode::Completion],
            supported_formats: &[BundleFormat::Gguf],
            install: Arc::new(move |_ctx| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    if fail {
                        Err(crate::error::install_failed("boom"))
                    } else {
                        Ok(())
                    }
                })
            }),
            run: Arc::new(|ctx| {
                Box::pin(async move {
                    ctx.cancel.cancelled().await;
                    Ok(())
                })
            }),
        }
    }

    #[tokio::test]
    async fn concurrent_acquires_install_exactly_once() {
        let coordinator = InstallCoordinator::new(PathBuf::from("/tmp/model-runner-test"));
        let counter = Arc::new(AtomicUsize::new(0));
        let descriptor = counting_descriptor("llama.cpp", Arc::clone(&counter), false);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let descriptor = descriptor.clone();
            let coordinator = &coordinator;
            handles.push(async move { coordinator.ensure_installed(&descriptor).await });
        }
        let results = futures_util::future::join_all(handles).await;
        assert!(results.into_iter().all(|r| r.is_ok()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_install_resets_gate_for_retry() {
        let coordinator = InstallCoordinator::new(PathBuf::from("/tmp/model-runner-test"));
        let counter = Arc::new(AtomicUsize::new(0));
        let descriptor = counting_descriptor("llama.cpp", Arc::clone(&counter), true);

        let first = coordinator.ensure_installed(&descriptor).await;
        assert!(first.is_err());

        let second = coordinator.ensure_installed(&descriptor).await;
        assert!(second.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn passthrough_backends_skip_install() {
        let coordinator = InstallCoordinator::new(PathBuf::from("/tmp/model-runner-test"));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut descriptor = counting_descriptor("openai-proxy", Arc::clone(&counter), false);
        descriptor.is_passthrough = true;

        coordinator.ensure_installed(&descriptor).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
