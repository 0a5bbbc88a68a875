use api::event::ProviderWebhook;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use http::StatusCode;

use crate::result::Result;
use crate::route::AppState;

pub fn route() -> Router<AppState> {
    Router::new().route(api::path::PROVIDER_WEBHOOK, post(provider_webhook))
}

async fn provider_webhook(
    State(state): State<AppState>,
    Json(hook): Json<ProviderWebhook>,
) -> Result<StatusCode> {
    state.reconciler.webhook(hook)?;
    Ok(StatusCode::OK)
}
