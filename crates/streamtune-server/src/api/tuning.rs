//! Worker and tuning overrides

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::json;
use streamtune_core::TuningReason;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WorkersRequest {
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub reason: TuningReason,
}

pub async fn set_workers(
    State(state): State<AppState>,
    Json(req): Json<WorkersRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let workers = state.engine.set_worker_count(req.count)?;
    Ok(Json(json!({ "workers": workers })))
}

/// Ask the optimizer to act now. Returns the tuning event, or
/// `{"applied": false}` when cooldown or stabilization holds it back.
pub async fn trigger(
    State(state): State<AppState>,
    Json(req): Json<TriggerRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match req.reason {
        TuningReason::HighCpu
        | TuningReason::HighLatency
        | TuningReason::UnreliableDevice
        | TuningReason::LowPerformance => {}
        other => {
            return Err(ApiError::bad_request(format!(
                "{} cannot be triggered",
                other
            )))
        }
    }

    let event = state.engine.trigger_tuning(req.reason);
    Ok(Json(match event {
        Some(event) => json!({ "applied": event.success, "event": event }),
        None => json!({ "applied": false }),
    }))
}
