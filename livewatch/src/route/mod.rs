use crate::config::Config;
use crate::presence::ViewerRegistry;
use crate::reconciler::Reconciler;
use crate::session::SessionRegistry;

pub mod heartbeat;
pub mod session;
pub mod stream;
pub mod sweep;
pub mod viewer;
pub mod webhook;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub reconciler: Reconciler,
    pub sessions: SessionRegistry,
    pub viewers: ViewerRegistry,
}
