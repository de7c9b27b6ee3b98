//! Device, stream and chunk endpoints

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use streamtune_core::{DeviceId, ProcessOutcome, StreamMetadata};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub id: String,
    pub host: String,
    pub port: u16,
}

/// Buffer signal reported by a renderer or the relay.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Underrun,
    Overrun,
    Dropout,
}

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub signal: Signal,
}

#[derive(Debug, Deserialize)]
pub struct VolumeRequest {
    pub volume: u8,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.id.is_empty() || req.host.is_empty() {
        return Err(ApiError::bad_request("id and host are required"));
    }
    let device = DeviceId::from(req.id);
    if !state.engine.register_device(device.clone(), &req.host, req.port) {
        return Err(ApiError::conflict(format!(
            "Device {} is already registered",
            device
        )));
    }
    state
        .addresses
        .insert(device.clone(), req.host.clone(), req.port)
        .await;
    info!("Registered {} at {}:{}", device, req.host, req.port);
    Ok((StatusCode::CREATED, Json(json!({ "id": device }))))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let device = DeviceId::from(id);
    if !state.engine.remove_device(&device) {
        return Err(ApiError::not_found(format!("Device not found: {}", device)));
    }
    state.addresses.remove(&device).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn open_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    metadata: Option<Json<StreamMetadata>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let device = DeviceId::from(id);
    let metadata = metadata.map(|Json(m)| m).unwrap_or_default();
    let buffer_size = state.engine.open_stream(&device, metadata).await?;
    Ok(Json(json!({ "id": device, "bufferSize": buffer_size })))
}

pub async fn close_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let device = DeviceId::from(id);
    if state.engine.close_stream(&device).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("No open stream for {}", device)))
    }
}

/// 200 with the processed chunk, 503 when the engine cannot take it now,
/// 422 when it was dropped.
pub async fn push_chunk(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let device = DeviceId::from(id);
    match state.engine.process(&device, body).await {
        ProcessOutcome::Processed(out) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            out,
        )
            .into_response(),
        ProcessOutcome::NotReady => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, "1")],
            Json(json!({ "ready": false })),
        )
            .into_response(),
        ProcessOutcome::Dropped(reason) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "dropped": reason })),
        )
            .into_response(),
    }
}

pub async fn signal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SignalRequest>,
) -> Json<serde_json::Value> {
    let device = DeviceId::from(id);
    let adjustment = match req.signal {
        Signal::Underrun => state.engine.report_underrun(&device),
        Signal::Overrun => state.engine.report_overrun(&device),
        Signal::Dropout => state.engine.report_dropout(&device),
    };
    Json(json!({ "adjustment": adjustment }))
}

pub async fn set_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<VolumeRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .set_volume(&DeviceId::from(id), req.volume)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
