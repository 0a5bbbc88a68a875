use std::time::Duration;

use api::request::CreateSession;
use api::response::Session;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use crate::error::AppError;
use crate::result::Result;
use crate::route::AppState;

pub fn admin_route() -> Router<AppState> {
    Router::new().route(api::path::SESSIONS, post(issue))
}

async fn issue(State(state): State<AppState>, Json(req): Json<CreateSession>) -> Result<Json<Session>> {
    if req.wallet_address.is_empty() {
        return Err(AppError::bad_request("walletAddress is required"));
    }
    let ttl = Duration::from_secs(req.ttl.unwrap_or(state.config.liveness.session_ttl));
    let session = state.sessions.issue(req.wallet_address, ttl);
    Ok(Json(Session {
        token: session.token,
        wallet_address: session.wallet_address,
        expires_at: session.expires_at.timestamp_millis(),
    }))
}
