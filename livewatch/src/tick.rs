use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::provider::ProviderApi;
use crate::route::AppState;

pub async fn provider_poll(state: AppState, provider: Arc<dyn ProviderApi>) {
    loop {
        tokio::time::sleep(Duration::from_millis(state.config.liveness.poll_tick_time.0)).await;
        let corrected = state.reconciler.poll(provider.as_ref()).await;
        if corrected > 0 {
            info!(corrected, "provider poll corrected liveness");
        } else {
            debug!("provider poll agrees with local state");
        }
    }
}

pub async fn staleness_sweep(state: AppState) {
    let timeout = Duration::from_millis(state.config.liveness.heartbeat_timeout.0);
    loop {
        tokio::time::sleep(Duration::from_millis(state.config.liveness.sweep_tick_time.0)).await;
        let ended = state.reconciler.sweep(timeout);
        if ended > 0 {
            info!(ended, ?timeout, "staleness sweep force-ended streams");
        }
        state.viewers.prune();
    }
}
