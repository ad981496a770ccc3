//! Minimal HTTP/1.1 client over a Unix domain socket, used both by the
//! readiness probe and the reverse-proxy path in [`crate::runner`]. One
//! connection per request: backend processes are local and short-lived
//! enough that connection pooling is not worth the bookkeeping at this
//! budget (see DESIGN.md).

use std::{path::Path, time::Duration};

use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use crate::error::{SchedulerError, upstream_error};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

pub fn full_body(bytes: Bytes) -> BoxBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Sends `req` over a fresh connection to `socket_path` and returns the
/// upstream response. The connection-driving task is spawned so the caller
/// can read a streamed body after this function returns.
pub async fn send(
    socket_path: &Path,
    req: Request<BoxBody>,
) -> Result<Response<Incoming>, SchedulerError> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|err| upstream_error(format!("connect to {}: {err}", socket_path.display())))?;
    let io = TokioIo::new(stream);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|err| upstream_error(format!("handshake with backend socket: {err}")))?;

    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!(target: "unixhttp", error = %err, "backend connection closed");
        }
    });

    sender
        .send_request(req)
        .await
        .map_err(|err| upstream_error(format!("backend request failed: {err}")))
}

/// Readiness probe per spec.md §4.3: try `/health` first, fall back to
/// `/v1/models` on non-2xx or connection refused. Success = any 2xx on
/// either path.
pub async fn probe_ready(socket_path: &Path, timeout: Duration) -> bool {
    for path in ["/health", "/v1/models"] {
        let req = Request::builder()
            .method("GET")
            .uri(path)
            .header("host", "localhost")
            .body(empty_body());
        let Ok(req) = req else { continue };

        let attempt = tokio::time::timeout(timeout, send(socket_path, req)).await;
        if let Ok(Ok(response)) = attempt
            && response.status().is_success()
        {
            return true;
        }
    }
    false
}
