// Route table for the Runroom API

use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/run", post(handlers::run_code))
        .route("/status", get(handlers::health_check))
        .route("/ws", get(handlers::ws_connect))
        .route("/metrics", get(handlers::scrape_metrics))
}
