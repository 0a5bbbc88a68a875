use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tower_http::validate_request::ValidateRequestHeaderLayer;
use tracing::{error, info, info_span};

use crate::auth::ManyValidate;
use crate::config::Config;
use crate::hook::WebHook;
use crate::presence::ViewerRegistry;
use crate::provider::HttpProvider;
use crate::reconciler::Reconciler;
use crate::route::{heartbeat, session as session_route, stream, sweep, viewer, webhook, AppState};
use crate::session::SessionRegistry;
use crate::store::MemStore;

pub mod config;
pub mod presence;
pub mod provider;
pub mod reconciler;
pub mod session;
pub mod store;

mod auth;
mod error;
mod hook;
mod result;
mod route;
mod tick;

pub use error::AppError;

pub async fn serve<F>(cfg: Config, listener: TcpListener, signal: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match listener.local_addr() {
        Ok(addr) => info!("Server listening on {}", addr),
        Err(e) => error!("listener address unavailable: {:?}", e),
    }

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(500))
        .timeout(Duration::from_millis(2000))
        .build()
        .unwrap_or_default();

    let reconciler = Reconciler::new(
        MemStore::new(),
        Duration::from_millis(cfg.liveness.idle_window.0),
    );
    for url in cfg.webhook.webhooks.iter() {
        tokio::spawn(WebHook::new(url.clone(), client.clone()).hook(reconciler.subscribe()));
    }

    let app_state = AppState {
        config: cfg.clone(),
        reconciler,
        sessions: SessionRegistry::new(),
        viewers: ViewerRegistry::new(Duration::from_millis(cfg.presence.timeout)),
    };

    let app = Router::new()
        .merge(
            stream::admin_route()
                .merge(session_route::admin_route())
                .merge(sweep::admin_route())
                .layer(ValidateRequestHeaderLayer::custom(ManyValidate::new(
                    cfg.auth.tokens.clone(),
                ))),
        )
        .merge(webhook::route())
        .merge(heartbeat::route())
        .merge(stream::route())
        .merge(viewer::route())
        .with_state(app_state.clone())
        .layer(if cfg.http.cors {
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
        })
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                info_span!(
                    "http_request",
                    uri = ?request.uri(),
                    method = ?request.method(),
                )
            }),
        );

    if cfg.provider.api_url.is_empty() {
        info!("provider api_url not set, provider poll disabled");
    } else {
        let provider = HttpProvider::new(
            client.clone(),
            cfg.provider.api_url.clone(),
            cfg.provider.api_key.clone(),
        );
        tokio::spawn(tick::provider_poll(app_state.clone(), Arc::new(provider)));
    }
    tokio::spawn(tick::staleness_sweep(app_state));

    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .unwrap_or_else(|e| error!("Application error: {e}"));
}
