//! Integration tests for the HTTP handler + normalized mux, driven over a
//! real TCP listener with `reqwest`, per spec.md §6's external interface and
//! end-to-end scenario 1.

#[path = "../common/support.rs"]
mod support;

use std::net::SocketAddr;

use model_runner::http::AppState;
use uuid::Uuid;

struct TestServer {
    base_url: String,
    _shutdown: tokio::task::JoinHandle<()>,
}

async fn start_server(scheduler: model_runner::scheduler::SchedulerHandle) -> TestServer {
    let state = AppState { scheduler };
    let router = model_runner::mux::build(state, &[]);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind should succeed");
    let addr: SocketAddr = listener.local_addr().expect("listener should have a local addr");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router.into_make_service()).await;
    });

    TestServer {
        base_url: format!("http://{addr}"),
        _shutdown: handle,
    }
}

fn sockets_dir(label: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("model-runner-http-test-{label}-{}", Uuid::now_v7()))
}

/// Scenario 1 (pull and serve): a chat-completion request against an unknown
/// but resolvable model acquires a runner, proxies to it, and returns its
/// JSON body; `/ps` then reports the runner idle.
#[tokio::test]
async fn chat_completion_round_trips_through_a_live_runner() {
    let descriptor = support::long_lived_backend("llama.cpp");
    let bundle = support::stub_bundle("ai/smollm2");
    let scheduler = support::spawn_scheduler(
        descriptor,
        bundle,
        sockets_dir("chat"),
        support::test_scheduler_config(300, 30),
    );
    let server = start_server(scheduler).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/engines/llama.cpp/v1/chat/completions", server.base_url))
        .json(&serde_json::json!({
            "model": "ai/smollm2",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .expect("request should complete");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("body should be json");
    assert_eq!(body["object"], "chat.completion");

    let ps: serde_json::Value = client
        .get(format!("{}/ps", server.base_url))
        .send()
        .await
        .expect("ps request should complete")
        .json()
        .await
        .expect("ps body should be json");
    let entries = ps.as_array().expect("ps returns an array");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["refcount"], 0);
    assert_eq!(entries[0]["backend"], "llama.cpp");
}

/// A request body missing the required `model` field is rejected before any
/// runner is acquired, per spec.md §7's `ConfigInvalid` → 400 mapping.
#[tokio::test]
async fn missing_model_field_is_rejected_with_400() {
    let descriptor = support::long_lived_backend("llama.cpp");
    let bundle = support::stub_bundle("ai/smollm2");
    let scheduler = support::spawn_scheduler(
        descriptor,
        bundle,
        sockets_dir("missing-model"),
        support::test_scheduler_config(300, 30),
    );
    let server = start_server(scheduler).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/v1/chat/completions", server.base_url))
        .json(&serde_json::json!({"messages": []}))
        .send()
        .await
        .expect("request should complete");
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.expect("body should be json");
    assert_eq!(body["error"]["code"], "config_invalid");
}

/// An unresolvable model reference surfaces as `model_not_found` → 404,
/// without ever constructing a runner.
#[tokio::test]
async fn unknown_model_is_rejected_with_404() {
    let descriptor = support::long_lived_backend("llama.cpp");
    let bundle = support::stub_bundle("ai/smollm2");
    let scheduler = support::spawn_scheduler(
        descriptor,
        bundle,
        sockets_dir("unknown-model"),
        support::test_scheduler_config(300, 30),
    );
    let server = start_server(scheduler).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/v1/chat/completions", server.base_url))
        .json(&serde_json::json!({"model": "ai/does-not-exist", "messages": []}))
        .send()
        .await
        .expect("request should complete");
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.expect("body should be json");
    assert_eq!(body["error"]["code"], "model_not_found");

    assert!(scheduler.list().await.is_empty());
}

/// Scenario 5 (unload): `POST /unload {"model": ...}` stops the live runner
/// and `/ps` no longer lists it.
#[tokio::test]
async fn unload_endpoint_stops_the_runner() {
    let descriptor = support::long_lived_backend("llama.cpp");
    let bundle = support::stub_bundle("ai/smollm2");
    let scheduler = support::spawn_scheduler(
        descriptor,
        bundle,
        sockets_dir("unload-endpoint"),
        support::test_scheduler_config(300, 30),
    );
    let server = start_server(scheduler.clone()).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/engines/llama.cpp/v1/chat/completions", server.base_url))
        .json(&serde_json::json!({"model": "ai/smollm2", "messages": []}))
        .send()
        .await
        .expect("warm-up request should complete");
    assert_eq!(scheduler.list().await.len(), 1);

    let response = client
        .post(format!("{}/unload", server.base_url))
        .json(&serde_json::json!({"model": "ai/smollm2"}))
        .send()
        .await
        .expect("unload request should complete");
    assert_eq!(response.status(), 204);
    assert!(scheduler.list().await.is_empty());
}

/// `/v1/models` and `/engines/{backend}/v1/models` both answer from the
/// scheduler's live pool, per spec.md §4.7's note that the core has no
/// separate pullable-model inventory of its own.
#[tokio::test]
async fn models_listing_reports_live_runners_only() {
    let descriptor = support::long_lived_backend("llama.cpp");
    let bundle = support::stub_bundle("ai/smollm2");
    let scheduler = support::spawn_scheduler(
        descriptor,
        bundle,
        sockets_dir("models"),
        support::test_scheduler_config(300, 30),
    );
    let server = start_server(scheduler).await;
    let client = reqwest::Client::new();

    let empty: serde_json::Value = client
        .get(format!("{}/v1/models", server.base_url))
        .send()
        .await
        .expect("models request should complete")
        .json()
        .await
        .expect("models body should be json");
    assert_eq!(empty["data"].as_array().expect("data is an array").len(), 0);

    client
        .post(format!("{}/engines/llama.cpp/v1/chat/completions", server.base_url))
        .json(&serde_json::json!({"model": "ai/smollm2", "messages": []}))
        .send()
        .await
        .expect("warm-up request should complete");

    let populated: serde_json::Value = client
        .get(format!("{}/v1/models", server.base_url))
        .send()
        .await
        .expect("models request should complete")
        .json()
        .await
        .expect("models body should be json");
    let data = populated["data"].as_array().expect("data is an array");
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["id"], "ai/smollm2");
}
