use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::machine::{AttachPath, MediaEvent, Source};
use crate::readiness::Readiness;
use crate::sink::SinkLease;

/// One attached media pipeline. The session owns it and must close it.
#[async_trait]
pub trait MediaTransport: Send {
    /// Local recovery after a stall or decode error, without renegotiating.
    async fn recover(&mut self) -> Result<(), SessionError>;
    /// Releases the connection and the sink lease. Idempotent.
    async fn close(&mut self);
}

pub struct Attachment {
    pub transport: Box<dyn MediaTransport>,
    pub events: mpsc::UnboundedReceiver<MediaEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub path: AttachPath,
    pub readiness: Readiness,
}

/// Turns a source into an attached transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn resolve(&self, source: &Source) -> Result<Resolution, SessionError>;
    async fn attach(
        &self,
        source: &Source,
        path: AttachPath,
        lease: SinkLease,
    ) -> Result<Attachment, SessionError>;
}
