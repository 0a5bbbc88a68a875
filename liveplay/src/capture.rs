use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use webrtc::track::track_local::TrackLocal;

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Local capture shared by a preview and a publish session. Clones read the
/// tracks; only the single [`CaptureAuthority`] may stop them.
#[derive(Clone)]
pub struct SharedCapture {
    tracks: Arc<Vec<LocalTrack>>,
    stopped: watch::Receiver<bool>,
}

/// Sole right to stop a [`SharedCapture`]. Not `Clone`: ownership moves,
/// it is never shared. Dropping it releases the capture.
pub struct CaptureAuthority {
    stop: watch::Sender<bool>,
}

impl SharedCapture {
    pub fn new(tracks: Vec<LocalTrack>) -> (Self, CaptureAuthority) {
        let (stop, stopped) = watch::channel(false);
        (
            Self {
                tracks: Arc::new(tracks),
                stopped,
            },
            CaptureAuthority { stop },
        )
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn is_released(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Resolves once the capture is released; producers stop on it.
    pub async fn released(&self) {
        let mut stopped = self.stopped.clone();
        // Err means the authority is gone, which also released the capture.
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }
}

impl CaptureAuthority {
    /// Stops every track. Consumes the authority so it cannot run twice.
    pub fn release(self) {
        drop(self);
    }

    pub fn is_released(&self) -> bool {
        *self.stop.borrow()
    }

    fn stop(&self) {
        if !self.stop.send_replace(true) {
            info!("capture released");
        }
    }
}

impl Drop for CaptureAuthority {
    fn drop(&mut self) {
        self.stop();
    }
}
