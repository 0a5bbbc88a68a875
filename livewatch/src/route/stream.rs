use api::request::CreateStream;
use api::response::Stream;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use http::StatusCode;

use crate::error::AppError;
use crate::result::Result;
use crate::route::AppState;
use crate::store::StreamSession;

pub fn admin_route() -> Router<AppState> {
    Router::new().route(api::path::STREAMS, post(create))
}

pub fn route() -> Router<AppState> {
    Router::new().route(&api::path::stream("{stream}"), get(show))
}

pub(crate) fn stream_view(state: &AppState, stream_id: &str) -> Result<Stream> {
    let session = state
        .reconciler
        .store()
        .get(stream_id)
        .ok_or_else(|| AppError::stream_not_found(stream_id))?;
    Ok(convert(session, state.viewers.count(stream_id)))
}

fn convert(session: StreamSession, viewers: u64) -> Stream {
    Stream {
        stream_id: session.stream_id,
        provider_stream_id: session.provider_stream_id,
        delivery_mode: session.delivery_mode,
        is_live: session.is_live,
        last_heartbeat: session.last_heartbeat.timestamp_millis(),
        ended_at: session.ended_at.map(|t| t.timestamp_millis()),
        viewers,
        recording_playback_id: session.recording_playback_id,
    }
}

async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateStream>,
) -> Result<(StatusCode, Json<Stream>)> {
    if req.stream_id.is_empty() {
        return Err(AppError::bad_request("streamId is required"));
    }
    let session = StreamSession::new(
        req.stream_id.clone(),
        req.provider_stream_id,
        req.delivery_mode,
        req.owner,
        Utc::now(),
    );
    if !state.reconciler.store().insert(session) {
        return Err(AppError::StreamAlreadyExists(req.stream_id));
    }
    Ok((StatusCode::CREATED, Json(stream_view(&state, &req.stream_id)?)))
}

async fn show(State(state): State<AppState>, Path(stream): Path<String>) -> Result<Json<Stream>> {
    stream_view(&state, &stream).map(Json)
}
