//! Bundle resolver: turns a `(model_ref, mode, backend_hint)` request into a
//! fully-keyed target ready for a Runner (spec.md §4.6).
//!
//! `ModelManager` is the external collaborator boundary — resolving a model
//! reference to bytes on disk (pulling an OCI artifact, reading a local
//! directory, whatever the deployment wires in) is explicitly out of scope
//! per spec.md §1's non-goals, so this crate only depends on the trait.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;

use crate::{
    config::BackendRuntimeConfig,
    error::{SchedulerError, mode_not_supported, model_not_found},
    registry::{BackendDescriptor, BackendRegistry},
    types::{BackendMode, ModelBundle, RunnerConfig, RunnerKey},
};

/// External collaborator that materializes a `ModelBundle` for a model
/// reference. Implementations own the OCI-pull / local-path-resolution
/// logic; this crate only calls `resolve`.
#[async_trait]
pub trait ModelManager: Send + Sync {
    async fn resolve(&self, model_ref: &str) -> Result<ModelBundle, SchedulerError>;
}

/// `ModelManager` backed by a flat directory of pre-materialized bundles,
/// named `<models_path>/<model_ref>/`. Good enough for local development and
/// for the integration tests; production deployments supply their own
/// `ModelManager` (OCI pull, remote cache, etc).
pub struct LocalModelManager {
    models_path: PathBuf,
}

impl LocalModelManager {
    pub fn new(models_path: PathBuf) -> Self {
        Self { models_path }
    }
}

#[async_trait]
impl ModelManager for LocalModelManager {
    async fn resolve(&self, model_ref: &str) -> Result<ModelBundle, SchedulerError> {
        let root = self.models_path.join(model_ref);
        if !root.is_dir() {
            return Err(model_not_found(format!(
                "no local bundle for {model_ref} under {}",
                self.models_path.display()
            )));
        }

        let gguf = find_with_extension(&root, "gguf");
        let safetensors = find_with_extension(&root, "safetensors");

        let (format, weight_path) = if let Some(path) = gguf {
            (crate::types::BundleFormat::Gguf, path)
        } else if let Some(path) = safetensors {
            (crate::types::BundleFormat::SafeTensors, path)
        } else {
            return Err(model_not_found(format!(
                "no recognized weight file under {}",
                root.display()
            )));
        };

        let projector_path = find_with_name(&root, "mmproj.gguf");
        let chat_template_path = find_with_name(&root, "chat_template.jinja");

        Ok(ModelBundle {
            root,
            model_ref: model_ref.to_string(),
            format,
            weight_path,
            projector_path,
            chat_template_path,
            context_size: 4096,
        })
    }
}

fn find_with_extension(dir: &std::path::Path, ext: &str) -> Option<PathBuf> {
    std::fs::read_dir(dir).ok()?.filter_map(|e| e.ok()).map(|e| e.path()).find(|p| {
        p.extension().and_then(|e| e.to_str()) == Some(ext)
    })
}

fn find_with_name(dir: &std::path::Path, name: &str) -> Option<PathBuf> {
    let path = dir.join(name);
    path.is_file().then_some(path)
}

pub struct ResolvedTarget {
    pub key: RunnerKey,
    pub descriptor: BackendDescriptor,
    pub bundle: Option<ModelBundle>,
    pub config: RunnerConfig,
    pub socket_path: Option<PathBuf>,
    pub remote_base_url: Option<String>,
}

pub struct BundleResolver {
    registry: std::sync::Arc<BackendRegistry>,
    model_manager: std::sync::Arc<dyn ModelManager>,
    sockets_dir: PathBuf,
    base_runner_config: RunnerConfig,
    backend_configs: Arc<BTreeMap<String, BackendRuntimeConfig>>,
}

impl BundleResolver {
    pub fn new(
        registry: std::sync::Arc<BackendRegistry>,
        model_manager: std::sync::Arc<dyn ModelManager>,
        sockets_dir: PathBuf,
        base_runner_config: RunnerConfig,
        backend_configs: Arc<BTreeMap<String, BackendRuntimeConfig>>,
    ) -> Self {
        Self {
            registry,
            model_manager,
            sockets_dir,
            base_runner_config,
            backend_configs,
        }
    }

    /// A backend's `extra_args` participate in the Runner fingerprint
    /// (spec.md §3 "configHash") so that an operator changing a backend's
    /// launch flags gets a fresh process instead of silently reusing one
    /// started under the old flags.
    fn runner_config_for(&self, backend_name: &str) -> RunnerConfig {
        let mut config = self.base_runner_config.clone();
        if let Some(backend_config) = self.backend_configs.get(backend_name) {
            config.runtime_flags = backend_config.extra_args.clone();
        }
        config
    }

    /// Resolves a request into a `ResolvedTarget`. Passthrough backends
    /// (identified by `backend_hint` naming a registered passthrough
    /// descriptor, or by the model reference carrying a `<backend>/` prefix
    /// matching one) skip `ModelManager` entirely — there is no local bundle
    /// to materialize.
    pub async fn resolve(
        &self,
        model_ref: &str,
        mode: BackendMode,
        backend_hint: Option<&str>,
    ) -> Result<ResolvedTarget, SchedulerError> {
        if let Some(hint) = backend_hint
            && let Ok(descriptor) = self.registry.get(hint)
            && descriptor.is_passthrough
        {
            return self.resolve_passthrough(model_ref, mode, descriptor);
        }

        let bundle = self.model_manager.resolve(model_ref).await?;

        let descriptor = match backend_hint {
            Some(hint) => self.registry.get(hint)?,
            None => self.registry.default_for(&bundle)?,
        };

        if !descriptor.supports_format(bundle.format) {
            return Err(crate::error::unsupported_format(format!(
                "backend {} does not support format {:?}",
                descriptor.name, bundle.format
            )));
        }
        if !descriptor.supports_mode(mode) {
            return Err(mode_not_supported(format!(
                "backend {} does not support mode {}",
                descriptor.name,
                mode.as_str()
            )));
        }

        let runner_config = self.runner_config_for(&descriptor.name);
        let key = RunnerKey::new(descriptor.name.clone(), model_ref.to_string(), mode, &runner_config);
        let socket_path = Some(self.sockets_dir.join(format!("{}.sock", key.fingerprint())));

        Ok(ResolvedTarget {
            key,
            descriptor,
            bundle: Some(bundle),
            config: runner_config,
            socket_path,
            remote_base_url: None,
        })
    }

    fn resolve_passthrough(
        &self,
        model_ref: &str,
        mode: BackendMode,
        descriptor: BackendDescriptor,
    ) -> Result<ResolvedTarget, SchedulerError> {
        if !descriptor.supports_mode(mode) {
            return Err(mode_not_supported(format!(
                "backend {} does not support mode {}",
                descriptor.name,
                mode.as_str()
            )));
        }
        let runner_config = self.runner_config_for(&descriptor.name);
        let key = RunnerKey::new(descriptor.name.clone(), model_ref.to_string(), mode, &runner_config);
        Ok(ResolvedTarget {
            key,
            descriptor,
            bundle: None,
            config: runner_config,
            socket_path: None,
            remote_base_url: Some("https://api.openai.com".to_string()),
        })
    }
}
