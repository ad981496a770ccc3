//! HTTP handler: OpenAI-shaped endpoints proxied to an acquired Runner
//! (spec.md §4.7). Parses `model` (and an optional `backend` path hint)
//! from the request, resolves a fingerprint through the scheduler, and
//! proxies the request/response over the Runner's socket. Release happens
//! implicitly — [`crate::runner::ReleaseOnDropBody`]'s `Drop` impl
//! decrements the refcount whether the body is read to completion, errors,
//! or is abandoned by a disconnecting client, so there is no explicit
//! release call here.

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use http_body_util::BodyExt;
use serde::Serialize;
use serde_json::Value;

use crate::{
    error::{config_invalid, SchedulerError, SchedulerErrorKind},
    runner::Runner,
    scheduler::SchedulerHandle,
    types::BackendMode,
    unixhttp,
};

/// Requests this core proxies are small JSON/SSE exchanges, not bulk
/// uploads; a generous but bounded buffer keeps a misbehaving client from
/// exhausting memory while it reads the `model` field out of the body.
const MAX_BUFFERED_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: SchedulerHandle,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

fn error_code(kind: SchedulerErrorKind) -> &'static str {
    match kind {
        SchedulerErrorKind::ModelNotFound => "model_not_found",
        SchedulerErrorKind::BackendNotFound => "backend_not_found",
        SchedulerErrorKind::UnsupportedFormat => "unsupported_format",
        SchedulerErrorKind::ModeNotSupported => "mode_not_supported",
        SchedulerErrorKind::InstallFailed => "install_failed",
        SchedulerErrorKind::StartupFailed => "startup_failed",
        SchedulerErrorKind::NotReady => "not_ready",
        SchedulerErrorKind::UpstreamError => "upstream_error",
        SchedulerErrorKind::ClientDisconnected => "client_disconnected",
        SchedulerErrorKind::ConfigInvalid => "config_invalid",
    }
}

/// Per spec.md §7: per-request errors log at Warn, Runner startup/install
/// failures at Error. `ClientDisconnected` never reaches here in practice
/// (the connection is already gone by the time it would be produced) but is
/// mapped defensively rather than panicking.
fn error_response(err: SchedulerError) -> Response {
    match err.kind {
        SchedulerErrorKind::StartupFailed | SchedulerErrorKind::InstallFailed => {
            tracing::error!(error = %err, kind = ?err.kind, "request failed: runner error");
        }
        _ => {
            tracing::warn!(error = %err, kind = ?err.kind, "request failed");
        }
    }

    let status = StatusCode::from_u16(err.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(ErrorBody {
            error: ErrorDetail {
                code: error_code(err.kind),
                message: err.message,
            },
        }),
    )
        .into_response()
}

async fn buffer_request(req: Request<Body>) -> Result<(http::request::Parts, Bytes), SchedulerError> {
    let (parts, body) = req.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|err| config_invalid(format!("failed to read request body: {err}")))?
        .to_bytes();
    if bytes.len() > MAX_BUFFERED_BODY_BYTES {
        return Err(config_invalid("request body exceeds the maximum size"));
    }
    Ok((parts, bytes))
}

/// Extracts `model` (required) from a JSON request body. The `model` field
/// is the only part of the dialect-specific payload the core itself reads;
/// everything else rides through untouched to the backend.
fn extract_model(body: &[u8]) -> Result<String, SchedulerError> {
    if body.is_empty() {
        return Err(config_invalid("request body is empty; expected a `model` field"));
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| config_invalid(format!("malformed JSON request body: {err}")))?;
    value
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| config_invalid("request body is missing required field `model`"))
}

fn to_upstream_request(parts: http::request::Parts, body: Bytes) -> Request<unixhttp::BoxBody> {
    Request::from_parts(parts, unixhttp::full_body(body))
}

async fn proxy(
    state: &AppState,
    backend_hint: Option<String>,
    mode: BackendMode,
    req: Request<Body>,
) -> Response {
    let (parts, body) = match buffer_request(req).await {
        Ok(parts) => parts,
        Err(err) => return error_response(err),
    };

    // GET requests (models listing) carry no body and no `model` field; the
    // caller routes those through a different handler. Every mode handler
    // below is POST-only and always carries a JSON body with `model`.
    let model_ref = match extract_model(&body) {
        Ok(model) => model,
        Err(err) => return error_response(err),
    };

    let runner = match state.scheduler.acquire(model_ref, mode, backend_hint).await {
        Ok(runner) => runner,
        Err(err) => return error_response(err),
    };

    serve_on(&runner, to_upstream_request(parts, body)).await
}

async fn serve_on(runner: &std::sync::Arc<Runner>, req: Request<unixhttp::BoxBody>) -> Response {
    match runner.serve(req).await {
        Ok(response) => response.map(Body::new),
        Err(err) => error_response(err),
    }
}

macro_rules! mode_handlers {
    ($with_backend:ident, $without_backend:ident, $mode:expr) => {
        pub async fn $with_backend(
            State(state): State<AppState>,
            Path(backend): Path<String>,
            req: Request<Body>,
        ) -> Response {
            proxy(&state, Some(backend), $mode, req).await
        }

        pub async fn $without_backend(State(state): State<AppState>, req: Request<Body>) -> Response {
            proxy(&state, None, $mode, req).await
        }
    };
}

mode_handlers!(chat_completions_for, chat_completions, BackendMode::Completion);
mode_handlers!(completions_for, completions, BackendMode::Completion);
mode_handlers!(embeddings_for, embeddings, BackendMode::Embedding);
mode_handlers!(rerank_for, rerank, BackendMode::Rerank);
mode_handlers!(score_for, score, BackendMode::Score);
mode_handlers!(images_generations_for, images_generations, BackendMode::Image);
// The OpenAI Responses dialect is a completions-shaped exchange; the
// dialect adapter above this core is responsible for translating it, this
// core only needs a mode to key the Runner on (see DESIGN.md).
mode_handlers!(responses_for, responses, BackendMode::Completion);

/// `GET /engines/{backend}/v1/models`. The core has no registry of
/// pullable models (that lives in the external `ModelManager`/OCI path);
/// it reports the models currently backing a live Runner for this backend,
/// which is the only model inventory the scheduler itself owns.
pub async fn list_models(State(state): State<AppState>, Path(backend): Path<String>) -> Response {
    let snapshots = state.scheduler.list().await;
    let data: Vec<_> = snapshots
        .into_iter()
        .filter(|snapshot| snapshot.backend == backend)
        .map(|snapshot| {
            serde_json::json!({
                "id": snapshot.model,
                "object": "model",
                "owned_by": snapshot.backend,
            })
        })
        .collect();
    Json(serde_json::json!({ "object": "list", "data": data })).into_response()
}

/// `GET /v1/models` (no backend segment): every model currently backing a
/// live Runner, across all backends.
pub async fn list_models_all(State(state): State<AppState>) -> Response {
    let snapshots = state.scheduler.list().await;
    let data: Vec<_> = snapshots
        .into_iter()
        .map(|snapshot| {
            serde_json::json!({
                "id": snapshot.model,
                "object": "model",
                "owned_by": snapshot.backend,
            })
        })
        .collect();
    Json(serde_json::json!({ "object": "list", "data": data })).into_response()
}

/// `GET /ps`: every live Runner, per spec.md §6. Passthrough backends are
/// included — see DESIGN.md's resolution of the corresponding Open
/// Question.
pub async fn ps(State(state): State<AppState>) -> Response {
    let snapshots = state.scheduler.list().await;
    let entries: Vec<_> = snapshots
        .into_iter()
        .map(|snapshot| {
            serde_json::json!({
                "backend": snapshot.backend,
                "model": snapshot.model,
                "mode": snapshot.mode,
                "status": snapshot.status,
                "refcount": snapshot.refcount,
                "lastUsed": snapshot.last_used_unix_secs,
            })
        })
        .collect();
    Json(entries).into_response()
}

/// `GET /status`: a coarse liveness summary, distinct from the per-Runner
/// detail `/ps` returns.
pub async fn status(State(state): State<AppState>) -> Response {
    let snapshots = state.scheduler.list().await;
    Json(serde_json::json!({
        "status": "ok",
        "runners": snapshots.len(),
    }))
    .into_response()
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum UnloadRequest {
    All { all: bool },
    One { model: String, backend: Option<String> },
}

/// `POST /unload`: `{model, backend}` unloads one key (backend defaults to
/// the registry's format-based default resolution over the current pool
/// entries matching that model), `{all: true}` unloads everything.
pub async fn unload(State(state): State<AppState>, req: Request<Body>) -> Response {
    let (_, body) = match buffer_request(req).await {
        Ok(parts) => parts,
        Err(err) => return error_response(err),
    };

    let request: UnloadRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error_response(config_invalid(format!("malformed unload request: {err}"))),
    };

    match request {
        UnloadRequest::All { all: true } => {
            let results = state.scheduler.unload_all().await;
            if let Some(err) = results.into_iter().find_map(Result::err) {
                return error_response(err);
            }
            StatusCode::NO_CONTENT.into_response()
        }
        UnloadRequest::All { all: false } | UnloadRequest::One { .. } => {
            let (model, backend_hint) = match request {
                UnloadRequest::One { model, backend } => (model, backend),
                _ => return error_response(config_invalid("unload request must set `all: true` or name a `model`")),
            };
            unload_one(&state, model, backend_hint).await
        }
    }
}

async fn unload_one(state: &AppState, model: String, backend_hint: Option<String>) -> Response {
    match state.scheduler.unload_matching(model, backend_hint).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}
