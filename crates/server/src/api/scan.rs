use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::stream::{Stream, StreamExt};
use scanner::ScanStatus;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::state::{AppState, ErrorResponse, JsonResult, ScanQuery, ScanStartedResponse};
use crate::utils::json_error;

pub async fn start_scan(
    State(state): State<AppState>,
    Query(query): Query<ScanQuery>,
) -> Result<(StatusCode, Json<ScanStartedResponse>), (StatusCode, Json<ErrorResponse>)> {
    if state.scanner.is_scanning() {
        return Err(json_error(StatusCode::CONFLICT, "scan already in progress"));
    }
    crate::scan::start_scan(&state, query.full, "api");
    Ok((
        StatusCode::ACCEPTED,
        Json(ScanStartedResponse {
            started: true,
            full_rescan: query.full,
        }),
    ))
}

pub async fn scan_status(State(state): State<AppState>) -> JsonResult<ScanStatus> {
    let scanner = state.scanner.clone();
    match tokio::task::spawn_blocking(move || scanner.status()).await {
        Ok(Ok(status)) => Ok(Json(status)),
        Ok(Err(err)) => Err(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("status error: {}", err),
        )),
        Err(err) => Err(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("status task failed: {}", err),
        )),
    }
}

pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|item| async move {
        match item {
            Ok(event) => match Event::default().event(event.name).json_data(&event.data) {
                Ok(sse) => Some(Ok(sse)),
                Err(err) => {
                    warn!("Failed to encode scan event: {}", err);
                    None
                }
            },
            Err(err) => {
                warn!("Event subscriber lagged: {}", err);
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
