use std::time::Duration;

use api::request::{Heartbeat, StopStream};
use reqwest::StatusCode;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum BeatError {
    /// Expired or unknown session; retrying cannot help
    #[error("session rejected")]
    Rejected,
    #[error("server answered {0}")]
    Status(StatusCode),
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("bad url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// Stopped by the owner, explicit stop sent
    Stopped,
    /// The server refused the session
    Rejected,
}

/// Broadcaster side of the liveness protocol.
#[derive(Clone)]
pub struct LivenessHeartbeat {
    http: reqwest::Client,
    base: Url,
    session_token: String,
    wallet_address: String,
    stream_id: String,
    interval: Duration,
}

impl LivenessHeartbeat {
    pub fn new(
        http: reqwest::Client,
        base: Url,
        session_token: String,
        wallet_address: String,
        stream_id: String,
    ) -> Self {
        Self {
            http,
            base,
            session_token,
            wallet_address,
            stream_id,
            interval: HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn beat(&self, is_live: bool) -> Result<(), BeatError> {
        let response = self
            .http
            .post(self.base.join(api::path::HEARTBEAT)?)
            .json(&Heartbeat {
                session_token: self.session_token.clone(),
                wallet_address: self.wallet_address.clone(),
                stream_id: self.stream_id.clone(),
                is_live,
            })
            .send()
            .await?;
        check(response.status())
    }

    /// Explicit client stop; wins over any other signal on the server.
    pub async fn stop_stream(&self) -> Result<(), BeatError> {
        let response = self
            .http
            .post(self.base.join(&api::path::stream_stop(&self.stream_id))?)
            .json(&StopStream {
                session_token: self.session_token.clone(),
                wallet_address: self.wallet_address.clone(),
            })
            .send()
            .await?;
        check(response.status())
    }

    pub fn spawn(self) -> HeartbeatHandle {
        let (stop, stop_rx) = oneshot::channel();
        HeartbeatHandle {
            stop: Some(stop),
            task: tokio::spawn(self.run(stop_rx)),
        }
    }

    async fn run(self, mut stop: oneshot::Receiver<()>) -> HeartbeatExit {
        loop {
            match self.beat(true).await {
                Ok(()) => debug!("heartbeat for {} accepted", self.stream_id),
                Err(BeatError::Rejected) => {
                    warn!("heartbeat for {} rejected, stopping", self.stream_id);
                    return HeartbeatExit::Rejected;
                }
                Err(e) => warn!("heartbeat for {} failed: {}", self.stream_id, e),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = &mut stop => break,
            }
        }
        match self.stop_stream().await {
            Ok(()) => info!("stream {} stopped", self.stream_id),
            Err(e) => warn!("stop for {} failed: {}", self.stream_id, e),
        }
        HeartbeatExit::Stopped
    }
}

fn check(status: StatusCode) -> Result<(), BeatError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(BeatError::Rejected),
        s => Err(BeatError::Status(s)),
    }
}

pub struct HeartbeatHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<HeartbeatExit>,
}

impl HeartbeatHandle {
    /// Sends the explicit stop unless the loop already ended.
    pub async fn stop(mut self) -> HeartbeatExit {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.task).await.unwrap_or(HeartbeatExit::Stopped)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
