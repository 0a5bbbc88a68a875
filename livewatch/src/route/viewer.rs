use api::request::Viewer;
use api::response::ViewerCount;
use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};

use crate::error::AppError;
use crate::result::Result;
use crate::route::AppState;

pub fn route() -> Router<AppState> {
    Router::new()
        .route(&api::path::viewers_join("{stream}"), post(join))
        .route(&api::path::viewers_leave("{stream}"), post(leave))
        .route(&api::path::viewers_heartbeat("{stream}"), post(heartbeat))
}

fn known(state: &AppState, stream: &str) -> Result<()> {
    state
        .reconciler
        .store()
        .get(stream)
        .map(|_| ())
        .ok_or_else(|| AppError::stream_not_found(stream))
}

async fn join(
    State(state): State<AppState>,
    Path(stream): Path<String>,
    Json(req): Json<Viewer>,
) -> Result<Json<ViewerCount>> {
    known(&state, &stream)?;
    let viewers = state.viewers.join(&stream, &req.viewer_id);
    Ok(Json(ViewerCount { viewers }))
}

async fn leave(
    State(state): State<AppState>,
    Path(stream): Path<String>,
    Json(req): Json<Viewer>,
) -> Result<Json<ViewerCount>> {
    let viewers = state.viewers.leave(&stream, &req.viewer_id);
    Ok(Json(ViewerCount { viewers }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(stream): Path<String>,
    Json(req): Json<Viewer>,
) -> Result<Json<ViewerCount>> {
    let viewers = state.viewers.heartbeat(&stream, &req.viewer_id);
    Ok(Json(ViewerCount { viewers }))
}
