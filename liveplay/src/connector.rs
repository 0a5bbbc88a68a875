use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::capture::SharedCapture;
use crate::error::SessionError;
use crate::hls::HlsLoader;
use crate::machine::{AttachPath, Delivery, Source};
use crate::native::NativePlayback;
use crate::readiness::{HttpManifest, ReadinessPoller};
use crate::signaling::{Direction, Signaling};
use crate::sink::SinkLease;
use crate::transport::{Attachment, Connector, Resolution};

/// Production wiring: WHIP/WHEP through [`Signaling`], playlists through a
/// native player when one is configured, otherwise the software loader.
pub struct DefaultConnector {
    http: reqwest::Client,
    signaling: Signaling,
    readiness: ReadinessPoller,
    native: Option<Arc<dyn NativePlayback>>,
    capture: Option<SharedCapture>,
}

impl DefaultConnector {
    pub fn new(http: reqwest::Client, signaling: Signaling) -> Self {
        Self {
            readiness: ReadinessPoller::new(Arc::new(HttpManifest::new(http.clone()))),
            http,
            signaling,
            native: None,
            capture: None,
        }
    }

    pub fn with_native(mut self, native: Arc<dyn NativePlayback>) -> Self {
        self.native = Some(native);
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessPoller) -> Self {
        self.readiness = readiness;
        self
    }

    /// Tracks published by WHIP sources.
    pub fn with_capture(mut self, capture: SharedCapture) -> Self {
        self.capture = Some(capture);
        self
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn resolve(&self, source: &Source) -> Result<Resolution, SessionError> {
        let path = match source.delivery {
            Delivery::Whep | Delivery::Whip => AttachPath::Signaling,
            Delivery::Manifest if self.native.is_some() => AttachPath::NativeManifest,
            Delivery::Manifest => AttachPath::SoftwareManifest,
        };
        let readiness = self.readiness.await_source(source).await;
        debug!("resolved {} to {:?} ({:?})", source.url, path, readiness);
        Ok(Resolution { path, readiness })
    }

    async fn attach(
        &self,
        source: &Source,
        path: AttachPath,
        lease: SinkLease,
    ) -> Result<Attachment, SessionError> {
        match path {
            AttachPath::Signaling => {
                let (direction, tracks) = match source.delivery {
                    Delivery::Whip => {
                        let capture = self
                            .capture
                            .as_ref()
                            .ok_or_else(|| SessionError::Protocol("no capture to publish".to_string()))?;
                        if capture.is_released() {
                            return Err(SessionError::Protocol("capture already released".to_string()));
                        }
                        (Direction::SendOnly, capture.tracks().to_vec())
                    }
                    _ => (Direction::RecvOnly, vec![]),
                };
                self.signaling
                    .negotiate(direction, &source.url, &tracks, lease)
                    .await
            }
            AttachPath::NativeManifest => match &self.native {
                Some(native) => native.load(&source.url, lease).await,
                None => Err(SessionError::Protocol("no native player".to_string())),
            },
            AttachPath::SoftwareManifest => {
                Ok(HlsLoader::start(self.http.clone(), source.url.clone(), lease))
            }
        }
    }
}
