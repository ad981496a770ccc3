//! Configuration: a single file, parsed permissively with `json5` so operators
//! can comment their config, validated against a JSON Schema document, then
//! deserialized into typed structs with per-field defaults so every field is
//! optional on disk. Environment variables layer on top of the file for the
//! subset spec.md §6 names as recognized by the core.

use std::{
    collections::BTreeMap,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{JSONSchema, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_CONFIG_FILE: &str = "model-runner.jsonc";
const DEFAULT_SCHEMA_FILE: &str = "model-runner.schema.json";

/// Flags the core controls on every backend launch; a client (via config or
/// request) may never inject one of these through `extra_args`, per spec.md
/// §6's "disallowed flags" clause and end-to-end scenario 6.
const DISALLOWED_ARG_PREFIXES: &[&str] = &[
    "--model",
    "-m",
    "--host",
    "--port",
    "--embedding",
    "--embeddings",
    "--mmproj",
];

fn default_enabled_true() -> bool {
    true
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("model-runner.sock")
}

fn default_models_path() -> PathBuf {
    PathBuf::from("models")
}

fn default_max_idle_secs() -> u64 {
    300
}

fn default_eviction_tick_secs() -> u64 {
    30
}

fn default_drain_deadline_secs() -> u64 {
    30
}

fn default_kill_grace_secs() -> u64 {
    10
}

fn default_readiness_deadline_secs() -> u64 {
    300
}

fn default_readiness_poll_interval_secs() -> u64 {
    2
}

fn default_logging_filter() -> String {
    "info".to_string()
}

fn default_logging_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_retention_days() -> usize {
    7
}

/// Either a Unix domain socket or a TCP bind address; the two are mutually
/// exclusive by construction (spec.md §6 "Listening surface") rather than by
/// a separate runtime check — see DESIGN.md's note on this Open Question.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Listen {
    Unix {
        #[serde(default = "default_socket_path")]
        path: PathBuf,
    },
    Tcp {
        addr: SocketAddr,
    },
}

impl Default for Listen {
    fn default() -> Self {
        Listen::Unix {
            path: default_socket_path(),
        }
    }
}

/// TLS is TCP-only; carries either an explicit cert/key pair or an
/// `auto_cert` toggle for a self-signed certificate, per spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub auto_cert: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRuntimeConfig {
    #[serde(default)]
    pub binary_path: Option<PathBuf>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub deferred: bool,
    #[serde(default = "default_enabled_true")]
    pub enabled: bool,
}

impl Default for BackendRuntimeConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            extra_args: Vec::new(),
            deferred: false,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggingRotation {
    Daily,
    Hourly,
}

impl Default for LoggingRotation {
    fn default() -> Self {
        Self::Daily
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_filter")]
    pub filter: String,
    #[serde(default = "default_logging_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub rotation: LoggingRotation,
    #[serde(default = "default_retention_days")]
    pub retention_days: usize,
    #[serde(default)]
    pub stderr_warn_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_logging_filter(),
            dir: default_logging_dir(),
            rotation: LoggingRotation::default(),
            retention_days: default_retention_days(),
            stderr_warn_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    #[serde(default)]
    pub max_runners: usize,
    #[serde(default = "default_eviction_tick_secs")]
    pub eviction_tick_secs: u64,
    #[serde(default = "default_drain_deadline_secs")]
    pub drain_deadline_secs: u64,
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    #[serde(default = "default_readiness_deadline_secs")]
    pub readiness_deadline_secs: u64,
    #[serde(default = "default_readiness_poll_interval_secs")]
    pub readiness_poll_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_secs: default_max_idle_secs(),
            max_runners: 0,
            eviction_tick_secs: default_eviction_tick_secs(),
            drain_deadline_secs: default_drain_deadline_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            readiness_deadline_secs: default_readiness_deadline_secs(),
            readiness_poll_interval_secs: default_readiness_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: Listen,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub cors: Vec<String>,
    #[serde(default)]
    pub backends: BTreeMap<String, BackendRuntimeConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default = "default_models_path")]
    pub models_path: PathBuf,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: Listen::default(),
            tls: TlsConfig::default(),
            cors: Vec::new(),
            backends: BTreeMap::new(),
            pool: PoolConfig::default(),
            models_path: default_models_path(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config_value: Value = json5::from_str(&config_content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;

        let config_base = config_path.parent().unwrap_or_else(|| Path::new("."));
        let schema_path = resolve_schema_path(config_base, &config_value)?;
        validate_against_schema(&config_value, &schema_path)?;

        let mut config: Config =
            serde_json::from_value(config_value).context("failed to deserialize config")?;

        if let Listen::Unix { path } = &mut config.listen
            && !path.is_absolute()
        {
            *path = config_base.join(&path);
        }

        apply_env_overrides(&mut config).context("config_invalid: environment overrides")?;
        validate_semantics(&config).context("config_invalid")?;

        Ok(config)
    }
}

/// Layers the environment variables named in spec.md §6 on top of the
/// file-derived config. `LLAMA_ARGS` merges into the `llama.cpp` backend's
/// `extra_args` exactly like an operator-supplied value would, so the
/// disallowed-flag check in [`validate_semantics`] covers it identically
/// (end-to-end scenario 6).
fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Ok(socket) = std::env::var("MODEL_RUNNER_SOCKET") {
        config.listen = Listen::Unix { path: PathBuf::from(socket) };
    }
    if let Ok(port) = std::env::var("MODEL_RUNNER_PORT") {
        let port: u16 = port
            .parse()
            .with_context(|| format!("MODEL_RUNNER_PORT is not a valid port: {port}"))?;
        config.listen = Listen::Tcp {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
        };
    }
    if let Ok(models_path) = std::env::var("MODEL_RUNNER_MODELS_PATH") {
        config.models_path = PathBuf::from(models_path);
    }
    if let Ok(extra) = std::env::var("LLAMA_ARGS") {
        let entry = config.backends.entry("llama.cpp".to_string()).or_default();
        entry.extra_args.extend(extra.split_whitespace().map(str::to_string));
    }
    for (env_name, backend_name) in [
        ("MODEL_RUNNER_LLAMA_CPP_BIN", "llama.cpp"),
        ("MODEL_RUNNER_VLLM_BIN", "vllm"),
        ("MODEL_RUNNER_MLX_BIN", "mlx"),
        ("MODEL_RUNNER_DIFFUSERS_BIN", "diffusers"),
    ] {
        if let Ok(bin) = std::env::var(env_name) {
            config
                .backends
                .entry(backend_name.to_string())
                .or_default()
                .binary_path = Some(PathBuf::from(bin));
        }
    }
    if let Ok(metrics) = std::env::var("MODEL_RUNNER_METRICS") {
        config.metrics.enabled = parse_bool(&metrics)?;
    }
    if let Ok(enable) = std::env::var("MODEL_RUNNER_TLS_ENABLE") {
        config.tls.enabled = parse_bool(&enable)?;
    }
    if let Ok(port) = std::env::var("MODEL_RUNNER_TLS_PORT") {
        config.tls.port = Some(
            port.parse()
                .with_context(|| format!("MODEL_RUNNER_TLS_PORT is not a valid port: {port}"))?,
        );
    }
    if let Ok(cert) = std::env::var("MODEL_RUNNER_TLS_CERT") {
        config.tls.cert_path = Some(PathBuf::from(cert));
    }
    if let Ok(key) = std::env::var("MODEL_RUNNER_TLS_KEY") {
        config.tls.key_path = Some(PathBuf::from(key));
    }
    if let Ok(auto_cert) = std::env::var("MODEL_RUNNER_TLS_AUTO_CERT") {
        config.tls.auto_cert = parse_bool(&auto_cert)?;
    }
    if let Ok(level) = std::env::var("MODEL_RUNNER_LOG_LEVEL") {
        config.logging.filter = level;
    }
    if let Ok(origins) = std::env::var("MODEL_RUNNER_CORS_ORIGINS") {
        config.cors = origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }

    Ok(())
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("expected a boolean, got '{other}'")),
    }
}

/// Checks invariants that can't be expressed in the JSON Schema alone:
/// CORS origins must be explicit (no wildcard), and no backend's
/// `extra_args` may carry a flag the core itself controls.
fn validate_semantics(config: &Config) -> Result<()> {
    if config.cors.iter().any(|origin| origin == "*") {
        bail!("cors origins may not include '*'; list the allowed origins explicitly");
    }

    for (name, backend) in &config.backends {
        for arg in &backend.extra_args {
            let token = arg.split('=').next().unwrap_or(arg);
            if DISALLOWED_ARG_PREFIXES.contains(&token) {
                bail!("backend '{name}' extra_args may not set disallowed flag '{token}'");
            }
        }
    }

    Ok(())
}

fn resolve_schema_path(config_base: &Path, config_value: &Value) -> Result<PathBuf> {
    if let Some(path_text) = config_value.get("$schema").and_then(|value| value.as_str()) {
        let configured = PathBuf::from(path_text);
        if configured.is_absolute() {
            return Ok(configured);
        }
        return Ok(config_base.join(&configured));
    }

    let local_default = config_base.join(DEFAULT_SCHEMA_FILE);
    if local_default.exists() {
        return Ok(local_default);
    }

    let cwd_default = PathBuf::from(DEFAULT_SCHEMA_FILE);
    if cwd_default.exists() {
        return Ok(cwd_default);
    }

    Err(anyhow!(
        "unable to resolve schema path: expected $schema in config or {DEFAULT_SCHEMA_FILE} next to it"
    ))
}

fn validate_against_schema(config_value: &Value, schema_path: &Path) -> Result<()> {
    let schema_content = fs::read_to_string(schema_path)
        .with_context(|| format!("failed to read schema {}", schema_path.display()))?;
    let schema: Value = serde_json::from_str(&schema_content)
        .with_context(|| format!("failed to parse schema {}", schema_path.display()))?;

    let compiled =
        JSONSchema::compile(&schema).map_err(|e| anyhow!("failed to compile schema: {e}"))?;

    match compiled.validate(config_value) {
        Ok(()) => Ok(()),
        Err(errors_iter) => {
            let validation_errors: Vec<ValidationError> = errors_iter.collect();
            let messages: Vec<String> = validation_errors
                .into_iter()
                .map(|error| error.to_string())
                .collect();
            Err(anyhow!("config validation failed: {}", messages.join("; ")))
        }
    }
}
