//! Shared test scaffolding for the pool and http integration suites: a
//! `ModelManager` stub and a backend descriptor that actually listens on its
//! assigned Unix socket and answers "200 OK" to anything, so readiness
//! probing and request proxying exercise the real transport instead of a
//! mock.

use std::{
    convert::Infallible,
    path::PathBuf,
    sync::{atomic::{AtomicUsize, Ordering}, Arc},
};

use async_trait::async_trait;
use hyper::{
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use model_runner::{
    bundle::ModelManager,
    error::{model_not_found, SchedulerError},
    install::InstallCoordinator,
    registry::{BackendDescriptor, BackendRegistry, InstallContext, RunContext},
    runner::RunnerTimings,
    scheduler::{self, SchedulerConfig, SchedulerHandle},
    types::{BackendMode, BundleFormat, ModelBundle, RunnerConfig},
    bundle::BundleResolver,
};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

pub struct StubManager {
    pub bundle: ModelBundle,
}

#[async_trait]
impl ModelManager for StubManager {
    async fn resolve(&self, model_ref: &str) -> Result<ModelBundle, SchedulerError> {
        if model_ref != self.bundle.model_ref {
            return Err(model_not_found(format!("no stub bundle for {model_ref}")));
        }
        Ok(self.bundle.clone())
    }
}

pub fn stub_bundle(model_ref: &str) -> ModelBundle {
    ModelBundle {
        root: PathBuf::from("/tmp/model-runner-it"),
        model_ref: model_ref.to_string(),
        format: BundleFormat::Gguf,
        weight_path: PathBuf::from("/tmp/model-runner-it/weights.gguf"),
        projector_path: None,
        chat_template_path: None,
        context_size: 4096,
    }
}

async fn respond_ok(_req: http::Request<Incoming>) -> Result<http::Response<http_body_util::Full<Bytes>>, Infallible> {
    Ok(http::Response::new(http_body_util::Full::new(Bytes::from_static(
        b"{\"id\":\"stub\",\"object\":\"chat.completion\"}",
    ))))
}

async fn serve_one(stream: tokio::net::UnixStream) {
    let io = TokioIo::new(stream);
    let _ = http1::Builder::new()
        .serve_connection(io, service_fn(respond_ok))
        .await;
}

async fn install_noop(_ctx: InstallContext) -> Result<(), SchedulerError> {
    Ok(())
}

/// A backend descriptor whose `run` binds a real Unix listener at the
/// assigned socket path and keeps answering requests until `cancel` fires —
/// standing in for a long-lived backend process in these tests.
pub fn long_lived_backend(name: &'static str) -> BackendDescriptor {
    BackendDescriptor {
        name: name.to_string(),
        deferred: false,
        is_passthrough: false,
        supported_modes: &[BackendMode::Completion],
        supported_formats: &[BundleFormat::Gguf],
        install: Arc::new(|ctx| Box::pin(install_noop(ctx))),
        run: Arc::new(move |ctx: RunContext| {
            Box::pin(async move {
                let socket_path = ctx.socket_path.expect("test backend always gets a socket");
                let listener = UnixListener::bind(&socket_path)
                    .map_err(|err| model_runner::error::startup_failed(format!("bind: {err}")))?;
                loop {
                    tokio::select! {
                        accepted = listener.accept() => {
                            if let Ok((stream, _)) = accepted {
                                tokio::spawn(serve_one(stream));
                            }
                        }
                        _ = ctx.cancel.cancelled() => break,
                    }
                }
                Ok(())
            })
        }),
    }
}

/// A backend descriptor that answers exactly one connection (enough to pass
/// the readiness probe) and then returns, simulating a process that exits
/// unexpectedly right after startup.
pub fn crashy_backend(name: &'static str) -> BackendDescriptor {
    BackendDescriptor {
        name: name.to_string(),
        deferred: false,
        is_passthrough: false,
        supported_modes: &[BackendMode::Completion],
        supported_formats: &[BundleFormat::Gguf],
        install: Arc::new(|ctx| Box::pin(install_noop(ctx))),
        run: Arc::new(move |ctx: RunContext| {
            Box::pin(async move {
                let socket_path = ctx.socket_path.expect("test backend always gets a socket");
                let listener = UnixListener::bind(&socket_path)
                    .map_err(|err| model_runner::error::startup_failed(format!("bind: {err}")))?;
                if let Ok((stream, _)) = listener.accept().await {
                    serve_one(stream).await;
                }
                Ok(())
            })
        }),
    }
}

/// Like [`long_lived_backend`] but bumps `counter` once per `run` invocation,
/// so a test can assert exactly one subprocess spawn happened behind N
/// concurrent acquires of the same key.
pub fn counting_long_lived_backend(name: &'static str, counter: Arc<AtomicUsize>) -> BackendDescriptor {
    BackendDescriptor {
        name: name.to_string(),
        deferred: false,
        is_passthrough: false,
        supported_modes: &[BackendMode::Completion],
        supported_formats: &[BundleFormat::Gguf],
        install: Arc::new(|ctx| Box::pin(install_noop(ctx))),
        run: Arc::new(move |ctx: RunContext| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let socket_path = ctx.socket_path.expect("test backend always gets a socket");
                let listener = UnixListener::bind(&socket_path)
                    .map_err(|err| model_runner::error::startup_failed(format!("bind: {err}")))?;
                loop {
                    tokio::select! {
                        accepted = listener.accept() => {
                            if let Ok((stream, _)) = accepted {
                                tokio::spawn(serve_one(stream));
                            }
                        }
                        _ = ctx.cancel.cancelled() => break,
                    }
                }
                Ok(())
            })
        }),
    }
}

/// A backend whose first `run` invocation exits immediately, as if the
/// process had crashed during startup, and whose second invocation behaves
/// like [`long_lived_backend`]. Lets a test assert that a failed Acquire
/// doesn't poison the key: a later Acquire for the same key rebuilds and
/// succeeds instead of replaying the first error forever.
pub fn flaky_then_long_lived_backend(name: &'static str, attempts: Arc<AtomicUsize>) -> BackendDescriptor {
    BackendDescriptor {
        name: name.to_string(),
        deferred: false,
        is_passthrough: false,
        supported_modes: &[BackendMode::Completion],
        supported_formats: &[BundleFormat::Gguf],
        install: Arc::new(|ctx| Box::pin(install_noop(ctx))),
        run: Arc::new(move |ctx: RunContext| {
            let attempts = Arc::clone(&attempts);
            Box::pin(async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt == 0 {
                    return Ok(());
                }
                let socket_path = ctx.socket_path.expect("test backend always gets a socket");
                let listener = UnixListener::bind(&socket_path)
                    .map_err(|err| model_runner::error::startup_failed(format!("bind: {err}")))?;
                loop {
                    tokio::select! {
                        accepted = listener.accept() => {
                            if let Ok((stream, _)) = accepted {
                                tokio::spawn(serve_one(stream));
                            }
                        }
                        _ = ctx.cancel.cancelled() => break,
                    }
                }
                Ok(())
            })
        }),
    }
}

/// A ready-to-use scheduler handle backed by a single registered backend and
/// a `StubManager` serving `bundle`. Timings are compressed so the pool and
/// http integration suites don't need multi-second sleeps to observe
/// readiness, draining and eviction.
pub fn test_scheduler_config(max_idle_secs: u64, eviction_tick_secs: u64) -> SchedulerConfig {
    SchedulerConfig {
        timings: RunnerTimings {
            readiness_poll_interval: std::time::Duration::from_millis(20),
            readiness_deadline: std::time::Duration::from_secs(5),
            drain_deadline: std::time::Duration::from_secs(2),
            kill_grace: std::time::Duration::from_millis(200),
        },
        eviction_tick: std::time::Duration::from_secs(eviction_tick_secs),
        max_idle_secs,
        max_runners: 0,
    }
}

pub fn spawn_scheduler(
    descriptor: BackendDescriptor,
    bundle: ModelBundle,
    sockets_dir: PathBuf,
    config: SchedulerConfig,
) -> SchedulerHandle {
    let registry = Arc::new(BackendRegistry::new());
    registry.register(descriptor).expect("register test backend");

    let install = Arc::new(InstallCoordinator::new(sockets_dir.join("install")));
    let manager = Arc::new(StubManager { bundle });
    std::fs::create_dir_all(&sockets_dir).expect("sockets dir should be creatable");
    let resolver = Arc::new(BundleResolver::new(
        registry,
        manager,
        sockets_dir,
        RunnerConfig {
            context_size: 4096,
            runtime_flags: Vec::new(),
            mode_flags: Vec::new(),
        },
        Arc::new(std::collections::BTreeMap::new()),
    ));

    scheduler::spawn(resolver, install, config, CancellationToken::new())
}
