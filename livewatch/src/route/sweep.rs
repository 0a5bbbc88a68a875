use std::time::Duration;

use api::request::SweepQuery;
use api::response::Sweep;
use axum::extract::{Query, State};
use axum::routing::post;
use axum::{Json, Router};

use crate::error::AppError;
use crate::result::Result;
use crate::route::AppState;

pub fn admin_route() -> Router<AppState> {
    Router::new().route(api::path::SWEEP, post(sweep))
}

/// Externally scheduled variant of the built-in sweep tick.
async fn sweep(State(state): State<AppState>, Query(query): Query<SweepQuery>) -> Result<Json<Sweep>> {
    let secs = query
        .timeout_minutes
        .max(1)
        .checked_mul(60)
        .ok_or_else(|| AppError::bad_request("timeout_minutes out of range"))?;
    let ended = state.reconciler.sweep(Duration::from_secs(secs));
    Ok(Json(Sweep {
        ended: ended as u64,
    }))
}
