//! Route assembly for the server surface.

use std::sync::Arc;

use axum::{Router, routing::get};

use crate::handlers;
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::api::health_check))
        .route("/v1/calls", get(handlers::api::list_calls))
        .route(
            "/v1/calls/{call_id}",
            get(handlers::api::get_call).delete(handlers::api::end_call),
        )
        .route("/ws/call/{call_id}", get(handlers::ws::ws_call_handler))
        .with_state(state)
}
