//! REST handlers: health check and live-call observability.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;
use serde_json::{Value, json};

use crate::errors::app_error::AppResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CallSummary {
    pub call_id: String,
    pub state: &'static str,
    pub age_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
}

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "callbridge",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn list_calls(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<CallSummary>>> {
    let mut summaries = Vec::new();
    for call_id in state.registry.call_ids().await {
        // A session may be torn down between listing and lookup.
        if let Ok(session) = state.registry.get(&call_id).await {
            summaries.push(CallSummary {
                call_id,
                state: session.turn_state().as_str(),
                age_ms: session.age().as_millis() as u64,
                end_reason: session.end_reason(),
            });
        }
    }
    Ok(Json(summaries))
}

pub async fn get_call(
    Path(call_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<CallSummary>> {
    let session = state.registry.get(&call_id).await?;
    Ok(Json(CallSummary {
        call_id,
        state: session.turn_state().as_str(),
        age_ms: session.age().as_millis() as u64,
        end_reason: session.end_reason(),
    }))
}

pub async fn end_call(
    Path(call_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Value>> {
    state.registry.get(&call_id).await?;
    state.registry.destroy(&call_id).await;
    Ok(Json(json!({ "status": "destroyed", "call_id": call_id })))
}
