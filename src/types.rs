use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type BackendId = String;
pub type ModelRef = String;

/// The kind of inference requested. A property of the *request*, not the backend —
/// some backends support multiple modes by launching with different flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    Completion,
    Embedding,
    Rerank,
    Score,
    Image,
}

impl BackendMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completion => "completion",
            Self::Embedding => "embedding",
            Self::Rerank => "rerank",
            Self::Score => "score",
            Self::Image => "image",
        }
    }
}

/// On-disk weight format of a materialized bundle, used by the registry's
/// `DefaultFor` backend-selection rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleFormat {
    Gguf,
    SafeTensors,
    Diffusers,
}

/// Read-only view of a locally materialized model. Lifetime outlives any Runner that
/// uses it — owned by the external `ModelManager`, the core only borrows paths out of
/// it to build subprocess argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelBundle {
    pub root: PathBuf,
    pub model_ref: ModelRef,
    pub format: BundleFormat,
    pub weight_path: PathBuf,
    pub projector_path: Option<PathBuf>,
    pub chat_template_path: Option<PathBuf>,
    pub context_size: u32,
}

/// Runtime flags that participate in a Runner's fingerprint, alongside the backend
/// name, model reference and mode. Two requests with equal `RunnerConfig` (and equal
/// backend/model/mode) share one process; any difference gets a separate one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub context_size: u32,
    #[serde(default)]
    pub runtime_flags: Vec<String>,
    #[serde(default)]
    pub mode_flags: Vec<String>,
}

impl RunnerConfig {
    fn config_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.context_size.to_le_bytes());
        for flag in &self.runtime_flags {
            hasher.update(flag.as_bytes());
            hasher.update([0u8]);
        }
        for flag in &self.mode_flags {
            hasher.update(flag.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        hex_encode(&digest[..8])
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Value-equality fingerprint identifying a Runner. `(backend, model, mode,
/// config_hash)` — see spec.md §3.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunnerKey {
    pub backend: BackendId,
    pub model_ref: ModelRef,
    pub mode: BackendMode,
    pub config_hash: String,
}

impl RunnerKey {
    pub fn new(backend: BackendId, model_ref: ModelRef, mode: BackendMode, config: &RunnerConfig) -> Self {
        Self {
            backend,
            model_ref,
            mode,
            config_hash: config.config_hash(),
        }
    }

    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.backend,
            self.model_ref,
            self.mode.as_str(),
            self.config_hash
        )
    }
}

impl std::fmt::Display for RunnerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}
