use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde_json::{Value, json};

use crate::config::EffectiveConfig;

pub fn router(config: Arc<EffectiveConfig>) -> Router {
    Router::new()
        .route("/_ping", get(handle_ping))
        .route("/info", get(handle_info))
        .with_state(config)
}

async fn handle_ping() -> &'static str {
    "OK"
}

async fn handle_info(State(config): State<Arc<EffectiveConfig>>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "pid": std::process::id(),
            "config": config.as_ref(),
        })),
    )
}
