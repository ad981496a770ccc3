//! Runner: one live backend process serving one `(backend, model, mode)` key.
//!
//! Owns a unique Unix socket, a cancellable subprocess, a request refcount
//! and a status string, per spec.md §3/§4.3. The pool (`crate::pool`) holds
//! `Arc<Runner>` handles; the scheduler loop (`crate::scheduler`) is the only
//! place that transitions a Runner's externally-visible state, so all
//! mutation here goes through a single `std::sync::Mutex`-guarded inner
//! struct rather than fine-grained locking.

use std::{
    path::PathBuf,
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, SystemTime},
};

use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use reqwest::Client as RemoteClient;
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{SchedulerError, not_ready, startup_failed, upstream_error},
    registry::{BackendDescriptor, RunContext},
    types::{BackendMode, ModelBundle, RunnerConfig, RunnerKey},
    unixhttp::{self, BoxBody},
};

/// Response body after it has left the transport layer: either the raw
/// `hyper::body::Incoming` from a local Unix-socket backend or a buffered
/// passthrough body, boxed over a common error type so callers (the HTTP
/// handler) don't need to care which.
pub type ProxyBody = http_body_util::combinators::BoxBody<Bytes, SchedulerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Installing,
    Starting,
    Ready,
    Draining,
    Failed,
    Exited,
}

impl RunnerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Exited)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RunnerSnapshot {
    pub backend: String,
    pub model: String,
    pub mode: BackendMode,
    pub status: RunnerState,
    pub refcount: u32,
    pub last_used_unix_secs: u64,
    pub first_error: Option<SchedulerError>,
    pub passthrough: bool,
}

struct Inner {
    state: RunnerState,
    last_used: SystemTime,
    first_error: Option<SchedulerError>,
}

/// Readiness / drain / kill timing, threaded in from `PoolConfig`
/// (spec.md §4.3's "configurable deadline (default 5 minutes)" etc).
#[derive(Debug, Clone, Copy)]
pub struct RunnerTimings {
    pub readiness_poll_interval: Duration,
    pub readiness_deadline: Duration,
    pub drain_deadline: Duration,
    pub kill_grace: Duration,
}

pub struct Runner {
    pub key: RunnerKey,
    descriptor: BackendDescriptor,
    bundle: Option<ModelBundle>,
    mode: BackendMode,
    config: RunnerConfig,
    socket_path: Option<PathBuf>,
    remote_base_url: Option<String>,
    cancel: CancellationToken,
    refcount: AtomicU32,
    inner: std::sync::Mutex<Inner>,
    process_task: AsyncMutex<Option<JoinHandle<Result<(), SchedulerError>>>>,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: RunnerKey,
        descriptor: BackendDescriptor,
        bundle: Option<ModelBundle>,
        mode: BackendMode,
        config: RunnerConfig,
        socket_path: Option<PathBuf>,
        remote_base_url: Option<String>,
    ) -> Self {
        Self {
            key,
            descriptor,
            bundle,
            mode,
            config,
            socket_path,
            remote_base_url,
            cancel: CancellationToken::new(),
            refcount: AtomicU32::new(0),
            inner: std::sync::Mutex::new(Inner {
                state: RunnerState::Installing,
                last_used: SystemTime::now(),
                first_error: None,
            }),
            process_task: AsyncMutex::new(None),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.descriptor.is_passthrough
    }

    pub fn state(&self) -> RunnerState {
        self.inner.lock().expect("runner lock poisoned").state
    }

    fn set_state(&self, state: RunnerState) {
        self.inner.lock().expect("runner lock poisoned").state = state;
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> RunnerSnapshot {
        let guard = self.inner.lock().expect("runner lock poisoned");
        RunnerSnapshot {
            backend: self.key.backend.clone(),
            model: self.key.model_ref.clone(),
            mode: self.key.mode,
            status: guard.state,
            refcount: self.refcount(),
            last_used_unix_secs: guard
                .last_used
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            first_error: guard.first_error.clone(),
            passthrough: self.descriptor.is_passthrough,
        }
    }

    fn touch(&self) {
        self.inner.lock().expect("runner lock poisoned").last_used = SystemTime::now();
    }

    /// Bumps refcount; used by the scheduler loop once an Acquire settles.
    /// Returns the new value.
    pub fn acquire_ref(&self) -> u32 {
        self.touch();
        self.refcount.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn release_ref(&self) -> u32 {
        self.touch();
        let previous = self.refcount.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            Some(v.saturating_sub(1))
        });
        previous.unwrap_or(0).saturating_sub(1).max(0)
    }

    /// Installs (if needed), spawns the backend process, and blocks until
    /// the readiness probe succeeds or the deadline expires. On return the
    /// runner is in `Ready` or `Failed`.
    pub async fn start(
        self: &std::sync::Arc<Self>,
        install: &crate::install::InstallCoordinator,
        timings: RunnerTimings,
    ) -> Result<(), SchedulerError> {
        self.set_state(RunnerState::Installing);
        if let Err(err) = install.ensure_installed(&self.descriptor).await {
            self.fail(err.clone());
            return Err(err);
        }

        self.set_state(RunnerState::Starting);

        let ctx = RunContext {
            backend: self.key.backend.clone(),
            socket_path: self.socket_path.clone(),
            bundle: self.bundle.clone(),
            mode: self.mode,
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        };
        let run = self.descriptor.run.clone();
        let handle = tokio::spawn(async move { (run)(ctx).await });
        *self.process_task.lock().await = Some(handle);

        if self.descriptor.is_passthrough {
            self.set_state(RunnerState::Ready);
            return Ok(());
        }

        let Some(socket_path) = self.socket_path.clone() else {
            let err = startup_failed("process-backed runner has no socket path");
            self.fail(err.clone());
            return Err(err);
        };

        let deadline = tokio::time::Instant::now() + timings.readiness_deadline;
        loop {
            if self.process_exited().await {
                let err = startup_failed(format!(
                    "backend process for {} exited before becoming ready",
                    self.key
                ));
                self.fail(err.clone());
                return Err(err);
            }

            if unixhttp::probe_ready(&socket_path, Duration::from_secs(2)).await {
                self.set_state(RunnerState::Ready);
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                let err = startup_failed(format!(
                    "readiness deadline exceeded for {}",
                    self.key
                ));
                self.fail(err.clone());
                self.force_kill().await;
                self.remove_socket();
                return Err(err);
            }

            tokio::select! {
                _ = tokio::time::sleep(timings.readiness_poll_interval) => {}
                _ = self.cancel.cancelled() => {
                    let err = startup_failed("startup cancelled by shutdown");
                    self.fail(err.clone());
                    return Err(err);
                }
            }
        }
    }

    async fn process_exited(&self) -> bool {
        let mut guard = self.process_task.lock().await;
        match guard.as_mut() {
            Some(handle) => handle.is_finished(),
            None => false,
        }
    }

    fn fail(&self, err: SchedulerError) {
        let mut guard = self.inner.lock().expect("runner lock poisoned");
        if guard.first_error.is_none() {
            guard.first_error = Some(err);
        }
        guard.state = RunnerState::Failed;
    }

    /// Proxies one HTTP request/response to the subprocess (or, for
    /// passthrough backends, to the remote API). Bumps refcount on entry;
    /// the returned body decrements it on drop so streaming SSE responses
    /// release only once the client finishes reading or disconnects.
    pub async fn serve(
        self: &std::sync::Arc<Self>,
        req: Request<BoxBody>,
    ) -> Result<Response<ReleaseOnDropBody>, SchedulerError> {
        if self.state() != RunnerState::Ready {
            return Err(not_ready(format!("runner for {} is not ready", self.key)));
        }

        self.acquire_ref();
        let guard = ReleaseGuard {
            runner: std::sync::Arc::clone(self),
        };

        let result = if self.descriptor.is_passthrough {
            self.serve_passthrough(req).await
        } else {
            self.serve_local(req).await
        };

        match result {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                Ok(Response::from_parts(
                    parts,
                    ReleaseOnDropBody {
                        inner: body,
                        _guard: guard,
                    },
                ))
            }
            Err(err) => Err(err),
        }
    }

    async fn serve_local(&self, req: Request<BoxBody>) -> Result<Response<ProxyBody>, SchedulerError> {
        let socket_path = self
            .socket_path
            .as_ref()
            .ok_or_else(|| upstream_error("runner has no socket path"))?;
        let response = unixhttp::send(socket_path, req).await?;
        let (parts, body) = response.into_parts();
        let boxed = body
            .map_err(|err| upstream_error(format!("backend stream error: {err}")))
            .boxed();
        Ok(Response::from_parts(parts, boxed))
    }

    async fn serve_passthrough(
        &self,
        req: Request<BoxBody>,
    ) -> Result<Response<ProxyBody>, SchedulerError> {
        let base = self
            .remote_base_url
            .as_deref()
            .ok_or_else(|| upstream_error("passthrough runner has no remote base url"))?;
        let (parts, body) = req.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|err| upstream_error(format!("failed to buffer request body: {err}")))?
            .to_bytes();

        let url = format!("{}{}", base.trim_end_matches('/'), parts.uri.path());
        let client = RemoteClient::new();
        let mut builder = client.request(
            reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
                .map_err(|err| upstream_error(format!("invalid method: {err}")))?,
            url,
        );
        for (name, value) in parts.headers.iter() {
            builder = builder.header(name, value);
        }
        let response = builder
            .body(bytes)
            .send()
            .await
            .map_err(|err| upstream_error(format!("passthrough request failed: {err}")))?;

        // Passthrough responses are small, buffered JSON in this core; SSE
        // passthrough is a dialect-adapter concern layered above.
        let status = response.status();
        let headers = response.headers().clone();
        let body_bytes = response
            .bytes()
            .await
            .map_err(|err| upstream_error(format!("failed to read passthrough body: {err}")))?;

        let mut builder = Response::builder().status(status);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let boxed: ProxyBody = Full::new(body_bytes)
            .map_err(|never: std::convert::Infallible| match never {})
            .boxed();
        builder
            .body(boxed)
            .map_err(|err| upstream_error(format!("failed to build response: {err}")))
    }

    pub fn drain(&self) {
        let mut guard = self.inner.lock().expect("runner lock poisoned");
        if guard.state == RunnerState::Ready {
            guard.state = RunnerState::Draining;
        }
    }

    /// Drain, wait for refcount==0 up to `drain_deadline`, cancel the
    /// subprocess context, force-kill after `kill_grace`, remove the socket.
    pub async fn stop(&self, timings: RunnerTimings) {
        self.drain();

        let drain_deadline = tokio::time::Instant::now() + timings.drain_deadline;
        while self.refcount() > 0 && tokio::time::Instant::now() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.cancel.cancel();

        let grace_deadline = tokio::time::Instant::now() + timings.kill_grace;
        loop {
            if self.process_exited().await {
                break;
            }
            if tokio::time::Instant::now() >= grace_deadline {
                self.force_kill().await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.remove_socket();
        self.set_state(RunnerState::Exited);
    }

    async fn force_kill(&self) {
        let mut guard = self.process_task.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }

    fn remove_socket(&self) {
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }

    /// True once the subprocess has exited unexpectedly while the runner was
    /// still Ready — the scheduler loop uses this to evict the entry
    /// (spec.md §4.3 "the runner transitions to Exited and is removed").
    pub async fn crashed(&self) -> bool {
        self.state() == RunnerState::Ready && self.process_exited().await
    }

    pub fn mark_crashed(&self) {
        let mut guard = self.inner.lock().expect("runner lock poisoned");
        if guard.first_error.is_none() {
            guard.first_error = Some(upstream_error(format!(
                "backend process for {} exited unexpectedly",
                self.key
            )));
        }
        guard.state = RunnerState::Exited;
        drop(guard);
        self.remove_socket();
    }
}

struct ReleaseGuard {
    runner: std::sync::Arc<Runner>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.runner.release_ref();
    }
}

/// Wraps an upstream response body so the Runner's refcount is decremented
/// exactly once the body is dropped — whether it was read to completion,
/// errored, or abandoned by a disconnecting client (spec.md §4.3/§4.7).
pub struct ReleaseOnDropBody {
    inner: ProxyBody,
    _guard: ReleaseGuard,
}

impl http_body::Body for ReleaseOnDropBody {
    type Data = hyper::body::Bytes;
    type Error = SchedulerError;

    fn poll_frame(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
