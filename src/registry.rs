//! Backend registry: maps a stable backend name to its capability-record
//! descriptor and selects a default backend for a bundle's format.
//!
//! Registration happens once at startup (`Service::bootstrap`); after that
//! the registry is read-only, so lookups take a read lock and never block on
//! writers per spec.md §4.1.

use std::{collections::BTreeMap, sync::Arc};

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{SchedulerError, backend_not_found, unsupported_format},
    types::{BackendId, BackendMode, BundleFormat, ModelBundle, RunnerConfig},
};

/// Arguments passed to a backend's `install` function. Installs run at most
/// once per backend (see [`crate::install::InstallCoordinator`]) inside a
/// service-scoped working directory where cached binaries live.
#[derive(Debug, Clone)]
pub struct InstallContext {
    pub backend: BackendId,
    pub work_dir: std::path::PathBuf,
}

/// Arguments passed to a backend's `run` function. `run` blocks until the
/// managed process exits (or, for passthrough backends, until `cancel` fires)
/// per spec.md §4.1's `Run(ctx, socket, bundle, mode, cfg) error` contract.
#[derive(Clone)]
pub struct RunContext {
    pub backend: BackendId,
    pub socket_path: Option<std::path::PathBuf>,
    pub bundle: Option<ModelBundle>,
    pub mode: BackendMode,
    pub config: RunnerConfig,
    pub cancel: CancellationToken,
}

pub type InstallFn =
    Arc<dyn Fn(InstallContext) -> BoxFuture<'static, Result<(), SchedulerError>> + Send + Sync>;
pub type RunFn =
    Arc<dyn Fn(RunContext) -> BoxFuture<'static, Result<(), SchedulerError>> + Send + Sync>;

/// A named inference engine adapter. Immutable after construction; no
/// inheritance hierarchy — adding a backend means constructing one of these
/// and registering it (spec.md §9 "dynamic dispatch over backends").
#[derive(Clone)]
pub struct BackendDescriptor {
    pub name: BackendId,
    pub deferred: bool,
    pub is_passthrough: bool,
    pub supported_modes: &'static [BackendMode],
    pub supported_formats: &'static [BundleFormat],
    pub install: InstallFn,
    pub run: RunFn,
}

impl BackendDescriptor {
    pub fn supports_mode(&self, mode: BackendMode) -> bool {
        self.supported_modes.contains(&mode)
    }

    pub fn supports_format(&self, format: BundleFormat) -> bool {
        self.supported_formats.contains(&format)
    }
}

impl std::fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("name", &self.name)
            .field("deferred", &self.deferred)
            .field("is_passthrough", &self.is_passthrough)
            .field("supported_modes", &self.supported_modes)
            .field("supported_formats", &self.supported_formats)
            .finish()
    }
}

/// Preference order `DefaultFor` walks when more than one registered backend
/// claims a format — llama.cpp for GGUF, vLLM (or MLX under `cfg(target_os =
/// "macos")`) for safetensors, diffusers for diffusers weights, per spec.md §4.1.
fn preference_order(format: BundleFormat) -> &'static [&'static str] {
    match format {
        BundleFormat::Gguf => &["llama.cpp"],
        BundleFormat::SafeTensors => {
            if cfg!(target_os = "macos") {
                &["mlx", "vllm"]
            } else {
                &["vllm", "mlx"]
            }
        }
        BundleFormat::Diffusers => &["diffusers"],
    }
}

#[derive(Default)]
pub struct BackendRegistry {
    backends: std::sync::RwLock<BTreeMap<BackendId, BackendDescriptor>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor once at startup. Later calls for the same name
    /// are rejected, matching spec.md §4.1 ("later calls are rejected").
    pub fn register(&self, descriptor: BackendDescriptor) -> Result<(), SchedulerError> {
        let mut guard = self.backends.write().expect("registry lock poisoned");
        if guard.contains_key(&descriptor.name) {
            return Err(backend_not_found(format!(
                "backend already registered: {}",
                descriptor.name
            )));
        }
        guard.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<BackendDescriptor, SchedulerError> {
        self.backends
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| backend_not_found(format!("unknown backend: {name}")))
    }

    /// Inspects `bundle.format` and returns the highest-preference registered
    /// backend that supports it. `UnsupportedFormat` if none match.
    pub fn default_for(&self, bundle: &ModelBundle) -> Result<BackendDescriptor, SchedulerError> {
        let guard = self.backends.read().expect("registry lock poisoned");
        for name in preference_order(bundle.format) {
            if let Some(descriptor) = guard.get(*name)
                && descriptor.supports_format(bundle.format)
            {
                return Ok(descriptor.clone());
            }
        }
        // Fall back to any registered backend that claims the format, in case
        // an operator registered a custom one outside the preference list.
        guard
            .values()
            .find(|descriptor| descriptor.supports_format(bundle.format))
            .cloned()
            .ok_or_else(|| {
                unsupported_format(format!(
                    "no registered backend supports format {:?}",
                    bundle.format
                ))
            })
    }

    pub fn list(&self) -> Vec<BackendDescriptor> {
        self.backends
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}
