use api::request::{Heartbeat, StopStream};
use api::response::Stream;
use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};

use crate::error::AppError;
use crate::result::Result;
use crate::route::stream::stream_view;
use crate::route::AppState;

pub fn route() -> Router<AppState> {
    Router::new()
        .route(api::path::HEARTBEAT, post(heartbeat))
        .route(&api::path::stream_stop("{stream}"), post(stop))
}

/// Session first, ownership second. A rejected caller never reaches the reconciler.
fn authorize(state: &AppState, stream_id: &str, token: &str, wallet_address: &str) -> Result<()> {
    state.sessions.authenticate(token, wallet_address)?;
    let stream = state
        .reconciler
        .store()
        .get(stream_id)
        .ok_or_else(|| AppError::stream_not_found(stream_id))?;
    match stream.owner {
        Some(owner) if !owner.eq_ignore_ascii_case(wallet_address) => {
            Err(AppError::unauthorized("not the stream owner"))
        }
        _ => Ok(()),
    }
}

async fn heartbeat(State(state): State<AppState>, Json(req): Json<Heartbeat>) -> Result<Json<Stream>> {
    authorize(&state, &req.stream_id, &req.session_token, &req.wallet_address)?;
    state.reconciler.heartbeat(&req.stream_id, req.is_live)?;
    stream_view(&state, &req.stream_id).map(Json)
}

async fn stop(
    State(state): State<AppState>,
    Path(stream): Path<String>,
    Json(req): Json<StopStream>,
) -> Result<Json<Stream>> {
    authorize(&state, &stream, &req.session_token, &req.wallet_address)?;
    state.reconciler.client_stop(&stream)?;
    stream_view(&state, &stream).map(Json)
}
