//! REST API endpoints for roomtester
//!
//! All endpoints are under /api/v1/. Transport endpoints return the state
//! snapshot after performing the command; history export returns CSV.

use crate::messages::ServerMessage;
use crate::{broadcast, AppState};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use roomtester_core::{HistoryError, PlaybackStatus};
use serde::Deserialize;

type ApiError = (StatusCode, String);

fn internal(e: anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn state_response(status: PlaybackStatus) -> Json<ServerMessage> {
    Json(ServerMessage::State(status))
}

/// Seek query `?position=SECS`
#[derive(Debug, Deserialize)]
pub struct SeekQuery {
    #[serde(default)]
    pub position: f64,
}

/// Source query `?name=NAME`
#[derive(Debug, Deserialize)]
pub struct SourceQuery {
    #[serde(default = "default_source")]
    pub name: String,
}

fn default_source() -> String {
    "ref".to_string()
}

/// Export query `?start=SECS&end=SECS`
#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub start: f64,
    pub end: Option<f64>,
}

/// Click query `?element=ID`
#[derive(Debug, Deserialize)]
pub struct ClickQuery {
    #[serde(default)]
    pub element: String,
}

/// HTTP status for a history failure
pub fn history_error_status(error: &HistoryError) -> StatusCode {
    match error {
        HistoryError::NoDataInRange { .. } => StatusCode::NOT_FOUND,
        HistoryError::Persistence(_) | HistoryError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<AppState>) -> Result<Json<ServerMessage>, ApiError> {
    let status = state.engine.get_status().await.map_err(internal)?;
    Ok(state_response(status))
}

/// POST /api/v1/transport/play
pub async fn play(State(state): State<AppState>) -> Result<Json<ServerMessage>, ApiError> {
    let status = state.engine.play().await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to start playback: {}", e),
        )
    })?;
    Ok(state_response(status))
}

/// POST /api/v1/transport/pause
pub async fn pause(State(state): State<AppState>) -> Result<Json<ServerMessage>, ApiError> {
    let status = state.engine.pause().await.map_err(internal)?;
    Ok(state_response(status))
}

/// POST /api/v1/transport/seek?position=SECS
pub async fn seek(
    State(state): State<AppState>,
    Query(query): Query<SeekQuery>,
) -> Result<Json<ServerMessage>, ApiError> {
    let status = state.engine.seek(query.position).await.map_err(internal)?;
    Ok(state_response(status))
}

/// POST /api/v1/source?name=NAME
pub async fn switch_source(
    State(state): State<AppState>,
    Query(query): Query<SourceQuery>,
) -> Result<Json<ServerMessage>, ApiError> {
    let status = state
        .engine
        .switch_source(query.name)
        .await
        .map_err(internal)?;
    Ok(state_response(status))
}

/// GET /api/v1/meters
pub async fn list_meters(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    let metering = state.metering.lock().map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to acquire lock on metering state.".to_string(),
        )
    })?;
    Ok(Json(metering.registry().names().map(String::from).collect()))
}

/// GET /api/v1/history/{meter}
pub async fn get_history(
    State(state): State<AppState>,
    Path(meter): Path<String>,
) -> Result<Json<ServerMessage>, ApiError> {
    let history = {
        let metering = state.metering.lock().map_err(|_| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to acquire lock on metering state.".to_string(),
            )
        })?;
        metering.history().history_for(&meter)
    };
    Ok(Json(ServerMessage::MeterHistory {
        name: meter,
        history,
    }))
}

/// GET /api/v1/history/{meter}/export?start=&end=
pub async fn export_history(
    State(state): State<AppState>,
    Path(meter): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Response {
    let end = query.end.unwrap_or(f64::INFINITY);
    let csv = match state.metering.lock() {
        Ok(metering) => metering.history().export_csv(&meter, query.start, end),
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to acquire lock on metering state.".to_string(),
            )
                .into_response()
        }
    };

    match csv {
        Ok(csv) => (
            [
                (header::CONTENT_TYPE, "text/csv".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}_history.csv\"", meter),
                ),
            ],
            csv,
        )
            .into_response(),
        Err(e) => (history_error_status(&e), e.to_string()).into_response(),
    }
}

/// POST /api/v1/client/click?element=ID
pub async fn client_click(
    State(state): State<AppState>,
    Query(query): Query<ClickQuery>,
) -> Result<Json<ServerMessage>, ApiError> {
    tracing::info!(element = %query.element, "Remote click");
    broadcast(
        &state.ws_tx,
        ServerMessage::RemoteClick {
            element: query.element,
        },
    );
    let status = state.engine.get_status().await.map_err(internal)?;
    Ok(state_response(status))
}

/// POST /api/v1/client/refresh
pub async fn client_refresh(State(state): State<AppState>) -> Json<serde_json::Value> {
    tracing::info!("Refresh all clients");
    broadcast(&state.ws_tx, ServerMessage::RemoteRefresh);
    Json(serde_json::json!({ "status": "ok" }))
}
