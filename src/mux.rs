//! Normalized mux: registers the OpenAI-shaped surface under both its
//! canonical `/engines/{backend}/v1/...` path and the backend-less aliases
//! (`/v1/...`, `/engines/v1/...`, plus the bare `/rerank`, `/score` and
//! `/engines/rerank`, `/engines/score` shorthands) without any URL
//! rewriting — each alias is its own route pointing at the same handler,
//! with `backend_hint` simply absent on the non-backend variants
//! (spec.md §4.8).
//!
//! CORS is handled by [`tower_http::cors::CorsLayer`] applied as the
//! outermost layer, so an `OPTIONS` preflight is answered before a request
//! ever reaches routing — there is no bespoke CORS policy engine here, per
//! spec.md's non-goals.

use axum::{
    routing::{get, post},
    Router,
};
use http::{HeaderValue, Method};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::http::{self, AppState};

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::new();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

/// Builds the full router: per-backend routes, backend-less aliases, and the
/// pool-management/introspection endpoints, all sharing one [`AppState`].
pub fn build(state: AppState, cors_origins: &[String]) -> Router {
    let engines = Router::new()
        .route("/engines/{backend}/v1/chat/completions", post(http::chat_completions_for))
        .route("/engines/{backend}/v1/completions", post(http::completions_for))
        .route("/engines/{backend}/v1/embeddings", post(http::embeddings_for))
        .route("/engines/{backend}/v1/rerank", post(http::rerank_for))
        .route("/engines/{backend}/v1/score", post(http::score_for))
        .route("/engines/{backend}/v1/images/generations", post(http::images_generations_for))
        .route("/engines/{backend}/v1/responses", post(http::responses_for))
        .route("/engines/{backend}/v1/models", get(http::list_models));

    let aliases = Router::new()
        .route("/v1/chat/completions", post(http::chat_completions))
        .route("/v1/completions", post(http::completions))
        .route("/v1/embeddings", post(http::embeddings))
        .route("/v1/rerank", post(http::rerank))
        .route("/v1/score", post(http::score))
        .route("/v1/images/generations", post(http::images_generations))
        .route("/v1/responses", post(http::responses))
        .route("/v1/models", get(http::list_models_all))
        .route("/responses", post(http::responses))
        .route("/engines/v1/chat/completions", post(http::chat_completions))
        .route("/engines/v1/completions", post(http::completions))
        .route("/engines/v1/embeddings", post(http::embeddings))
        .route("/engines/v1/rerank", post(http::rerank))
        .route("/engines/v1/score", post(http::score))
        .route("/engines/v1/images/generations", post(http::images_generations))
        .route("/engines/v1/responses", post(http::responses))
        .route("/engines/v1/models", get(http::list_models_all))
        .route("/rerank", post(http::rerank))
        .route("/score", post(http::score))
        .route("/engines/rerank", post(http::rerank))
        .route("/engines/score", post(http::score));

    let management = Router::new()
        .route("/ps", get(http::ps))
        .route("/status", get(http::status))
        .route("/unload", post(http::unload));

    Router::new()
        .merge(engines)
        .merge(aliases)
        .merge(management)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cors_list_still_yields_a_layer() {
        // No origins configured means no cross-origin access is granted; this
        // must not panic building the layer (the service still works for
        // same-origin / non-browser clients).
        let _layer = cors_layer(&[]);
    }

    #[test]
    fn invalid_origin_strings_are_skipped_not_fatal() {
        let _layer = cors_layer(&["not a valid header value \u{0}".to_string()]);
    }
}
