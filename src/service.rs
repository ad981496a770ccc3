//! Service bootstrap: wires config into a running server (spec.md §4 end to
//! end). Mirrors the teacher's `server::run` — prepare the listening
//! surface, register a signal-driven exit path, serve until asked to stop,
//! clean up on the way out — generalized from a single Unix-socket NDJSON
//! listener to an axum HTTP server behind either a Unix socket or TCP, with
//! a scheduler loop and a pool of backend processes underneath it.

use std::{
    fs,
    io::ErrorKind,
    os::unix::fs::FileTypeExt,
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tokio::{
    net::{TcpListener, UnixListener},
    signal::unix::{SignalKind, signal},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    backends,
    bundle::{BundleResolver, LocalModelManager},
    config::{Config, Listen},
    http::AppState,
    install::InstallCoordinator,
    mux,
    registry::BackendRegistry,
    runner::RunnerTimings,
    scheduler::{self, SchedulerConfig},
    types::RunnerConfig,
};

enum ExitReason {
    Signal(&'static str),
}

pub async fn run(config: Config) -> Result<()> {
    let _logging_guard =
        crate::logging::init_tracing(&config.logging).context("failed to initialize logging")?;

    let run_dir = std::env::temp_dir().join(format!("model-runner-{}", Uuid::now_v7()));
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create runtime directory {}", run_dir.display()))?;

    let registry = Arc::new(build_registry(&config));
    let install = Arc::new(InstallCoordinator::new(run_dir.join("install")));
    let model_manager = Arc::new(LocalModelManager::new(config.models_path.clone()));
    let base_runner_config = RunnerConfig {
        context_size: 4096,
        runtime_flags: Vec::new(),
        mode_flags: Vec::new(),
    };
    let resolver = Arc::new(BundleResolver::new(
        Arc::clone(&registry),
        model_manager,
        run_dir.join("sockets"),
        base_runner_config,
        Arc::new(config.backends.clone()),
    ));
    fs::create_dir_all(run_dir.join("sockets"))
        .context("failed to create runner socket directory")?;

    if config.tls.enabled {
        warn!(
            "tls.enabled is set, but TLS termination is outside this core's scope; \
             run it behind a terminating proxy instead"
        );
    }

    let shutdown_token = CancellationToken::new();
    let scheduler_config = SchedulerConfig {
        timings: RunnerTimings {
            readiness_poll_interval: Duration::from_secs(config.pool.readiness_poll_interval_secs),
            readiness_deadline: Duration::from_secs(config.pool.readiness_deadline_secs),
            drain_deadline: Duration::from_secs(config.pool.drain_deadline_secs),
            kill_grace: Duration::from_secs(config.pool.kill_grace_secs),
        },
        eviction_tick: Duration::from_secs(config.pool.eviction_tick_secs),
        max_idle_secs: config.pool.max_idle_secs,
        max_runners: config.pool.max_runners,
    };
    let scheduler = scheduler::spawn(resolver, install, scheduler_config, shutdown_token.clone());

    let state = AppState { scheduler: scheduler.clone() };
    let router = mux::build(state, &config.cors);

    let exit_reason = match &config.listen {
        Listen::Unix { path } => serve_unix(path, router).await?,
        Listen::Tcp { addr } => serve_tcp(*addr, router).await?,
    };

    match exit_reason {
        ExitReason::Signal(name) => info!(signal = name, "shutting down"),
    }

    scheduler.shutdown().await;

    if let Listen::Unix { path } = &config.listen {
        cleanup_socket_path(path).context("failed to clean up listening socket")?;
    }
    if let Err(err) = fs::remove_dir_all(&run_dir) {
        warn!(dir = %run_dir.display(), error = %err, "failed to remove runtime directory");
    }

    Ok(())
}

fn build_registry(config: &Config) -> BackendRegistry {
    let registry = BackendRegistry::new();
    let default_runtime = crate::config::BackendRuntimeConfig::default();
    let runtime_for = |name: &str| config.backends.get(name).unwrap_or(&default_runtime);

    for (name, descriptor) in [
        ("llama.cpp", backends::llama_cpp(runtime_for("llama.cpp"))),
        ("vllm", backends::vllm(runtime_for("vllm"))),
        ("mlx", backends::mlx(runtime_for("mlx"))),
        ("diffusers", backends::diffusers(runtime_for("diffusers"))),
    ] {
        if runtime_for(name).enabled
            && let Err(err) = registry.register(descriptor)
        {
            warn!(backend = name, error = %err, "failed to register backend");
        }
    }

    if let Err(err) = registry.register(backends::openai_proxy()) {
        warn!(backend = "openai-proxy", error = %err, "failed to register backend");
    }

    registry
}

async fn serve_unix(path: &Path, router: axum::Router) -> Result<ExitReason> {
    prepare_socket_path(path)?;
    let listener = UnixListener::bind(path)
        .with_context(|| format!("unable to bind socket {}", path.display()))?;

    info!(path = %path.display(), "model-runner listening on unix socket");

    tokio::select! {
        result = axum::serve(listener, router.into_make_service()) => {
            result.context("server loop exited with an error")?;
            Ok(ExitReason::Signal("server closed"))
        }
        reason = wait_for_signal() => Ok(reason),
    }
}

async fn serve_tcp(addr: std::net::SocketAddr, router: axum::Router) -> Result<ExitReason> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("unable to bind {addr}"))?;

    info!(%addr, "model-runner listening on tcp");

    tokio::select! {
        result = axum::serve(listener, router.into_make_service()) => {
            result.context("server loop exited with an error")?;
            Ok(ExitReason::Signal("server closed"))
        }
        reason = wait_for_signal() => Ok(reason),
    }
}

async fn wait_for_signal() -> ExitReason {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(err) => {
            warn!(error = %err, "unable to listen for SIGINT");
            std::future::pending().await
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(err) => {
            warn!(error = %err, "unable to listen for SIGTERM");
            std::future::pending().await
        }
    };

    tokio::select! {
        _ = sigint.recv() => ExitReason::Signal("SIGINT"),
        _ = sigterm.recv() => ExitReason::Signal("SIGTERM"),
    }
}

fn prepare_socket_path(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("unable to create {}", parent.display()))?;
    }

    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_socket() || metadata.is_file() {
                fs::remove_file(path)
                    .with_context(|| format!("unable to remove stale socket {}", path.display()))?;
            } else {
                bail!(
                    "socket path exists but is not removable as file/socket: {}",
                    path.display()
                );
            }
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("unable to inspect {}", path.display()));
        }
    }

    Ok(())
}

fn cleanup_socket_path(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("unable to remove {}", path.display())),
    }
}
