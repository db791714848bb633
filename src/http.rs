use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::engine::types::EngineStats;

#[derive(Clone)]
pub struct HttpState {
    pub stats: watch::Receiver<EngineStats>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<EngineStats> {
    Json(state.stats.borrow().clone())
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
