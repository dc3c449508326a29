pub mod blocks;
pub mod types;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};

use blocks::AppState;

/// Build the HTTP router over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/strata/v1/health", get(health))
        .route("/v1/blocks", get(blocks::list_blocks))
        .route("/v1/blocks/:name/forward", post(blocks::forward))
        .route("/v1/blocks/:name/backward", post(blocks::backward))
        .route("/v1/blocks/:name/sessions", post(blocks::open_session))
        .route("/v1/blocks/:name/sessions/:handle/step", post(blocks::step))
        .route(
            "/v1/blocks/:name/sessions/:handle",
            axum::routing::delete(blocks::close_session),
        )
        .with_state(state)
}

/// GET /strata/v1/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok"
    }))
}
