use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use api::{request::Viewer, response::ViewerCount};
use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use url::Url;

/// Looser than the liveness heartbeat: undercounting viewers is cheap.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

#[async_trait]
pub trait PresenceApi: Send + Sync {
    async fn join(&self, stream_id: &str, viewer_id: &str) -> Result<u64>;
    async fn leave(&self, stream_id: &str, viewer_id: &str) -> Result<u64>;
    async fn heartbeat(&self, stream_id: &str, viewer_id: &str) -> Result<()>;
}

pub struct HttpPresence {
    http: reqwest::Client,
    base: Url,
}

impl HttpPresence {
    pub fn new(http: reqwest::Client, base: Url) -> Self {
        Self { http, base }
    }

    async fn post(&self, path: String, viewer_id: &str) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(self.base.join(&path)?)
            .json(&Viewer {
                viewer_id: viewer_id.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(response)
    }
}

#[async_trait]
impl PresenceApi for HttpPresence {
    async fn join(&self, stream_id: &str, viewer_id: &str) -> Result<u64> {
        let count: ViewerCount = self
            .post(api::path::viewers_join(stream_id), viewer_id)
            .await?
            .json()
            .await?;
        Ok(count.viewers)
    }

    async fn leave(&self, stream_id: &str, viewer_id: &str) -> Result<u64> {
        let count: ViewerCount = self
            .post(api::path::viewers_leave(stream_id), viewer_id)
            .await?
            .json()
            .await?;
        Ok(count.viewers)
    }

    async fn heartbeat(&self, stream_id: &str, viewer_id: &str) -> Result<()> {
        self.post(api::path::viewers_heartbeat(stream_id), viewer_id)
            .await?;
        Ok(())
    }
}

/// Counts this viewer only while the page is visible.
pub struct PresenceTracker {
    viewer_id: String,
    viewers: watch::Receiver<u64>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PresenceTracker {
    pub fn spawn(
        api: Arc<dyn PresenceApi>,
        stream_id: String,
        visibility: watch::Receiver<Visibility>,
    ) -> Self {
        Self::spawn_with_interval(api, stream_id, visibility, HEARTBEAT_INTERVAL)
    }

    pub fn spawn_with_interval(
        api: Arc<dyn PresenceApi>,
        stream_id: String,
        visibility: watch::Receiver<Visibility>,
        interval: Duration,
    ) -> Self {
        let viewer_id = uuid::Uuid::new_v4().to_string();
        let (viewers_tx, viewers) = watch::channel(0);
        let (stop, stop_rx) = oneshot::channel();
        let presence = Presence {
            api,
            stream_id,
            viewer_id: viewer_id.clone(),
            joined: false,
            viewers: viewers_tx,
        };
        let task = tokio::spawn(presence.run(visibility, interval, stop_rx));
        Self {
            viewer_id,
            viewers,
            stop: Some(stop),
            task: Some(task),
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    /// Last count reported by the server.
    pub fn viewers(&self) -> u64 {
        *self.viewers.borrow()
    }

    /// Leaves if joined and waits for the call to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        // The task still leaves on its own once the stop sender is gone.
        self.stop.take();
    }
}

struct Presence {
    api: Arc<dyn PresenceApi>,
    stream_id: String,
    viewer_id: String,
    joined: bool,
    viewers: watch::Sender<u64>,
}

impl Presence {
    async fn run(
        mut self,
        mut visibility: watch::Receiver<Visibility>,
        interval: Duration,
        mut stop: oneshot::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let initial = *visibility.borrow_and_update();
        if initial == Visibility::Visible {
            self.join().await;
        }

        loop {
            tokio::select! {
                _ = &mut stop => break,
                changed = visibility.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *visibility.borrow_and_update();
                    match current {
                        Visibility::Visible => self.join().await,
                        Visibility::Hidden => self.leave().await,
                    }
                }
                _ = ticker.tick() => {
                    if self.joined {
                        if let Err(e) = self.api.heartbeat(&self.stream_id, &self.viewer_id).await {
                            debug!("presence heartbeat failed: {}", e);
                        }
                    } else if *visibility.borrow() == Visibility::Visible {
                        // An earlier join failed.
                        self.join().await;
                    }
                }
            }
        }
        self.leave().await;
    }

    async fn join(&mut self) {
        if self.joined {
            return;
        }
        match self.api.join(&self.stream_id, &self.viewer_id).await {
            Ok(count) => {
                self.joined = true;
                self.viewers.send_replace(count);
            }
            Err(e) => warn!("presence join for {} failed: {}", self.stream_id, e),
        }
    }

    async fn leave(&mut self) {
        if !self.joined {
            return;
        }
        self.joined = false;
        match self.api.leave(&self.stream_id, &self.viewer_id).await {
            Ok(count) => {
                self.viewers.send_replace(count);
            }
            Err(e) => warn!("presence leave for {} failed: {}", self.stream_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
        fail_joins: Mutex<u32>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PresenceApi for Recorder {
        async fn join(&self, _stream_id: &str, _viewer_id: &str) -> Result<u64> {
            {
                let mut fail = self.fail_joins.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    self.calls.lock().unwrap().push("join-failed");
                    anyhow::bail!("unavailable");
                }
            }
            self.calls.lock().unwrap().push("join");
            Ok(1)
        }

        async fn leave(&self, _stream_id: &str, _viewer_id: &str) -> Result<u64> {
            self.calls.lock().unwrap().push("leave");
            Ok(0)
        }

        async fn heartbeat(&self, _stream_id: &str, _viewer_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push("heartbeat");
            Ok(())
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_drives_membership() {
        let api = Arc::new(Recorder::default());
        let (visibility, rx) = watch::channel(Visibility::Visible);
        let tracker = PresenceTracker::spawn(api.clone(), "s1".to_string(), rx);
        settle().await;
        assert_eq!(tracker.viewers(), 1);

        tokio::time::sleep(Duration::from_secs(65)).await;
        visibility.send_replace(Visibility::Hidden);
        settle().await;
        assert_eq!(tracker.viewers(), 0);

        // Hidden pages send nothing.
        tokio::time::sleep(Duration::from_secs(120)).await;
        visibility.send_replace(Visibility::Visible);
        settle().await;
        tracker.stop().await;

        assert_eq!(
            api.calls(),
            vec!["join", "heartbeat", "heartbeat", "leave", "join", "leave"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_from_start_never_joins() {
        let api = Arc::new(Recorder::default());
        let (_visibility, rx) = watch::channel(Visibility::Hidden);
        let tracker = PresenceTracker::spawn(api.clone(), "s1".to_string(), rx);
        tokio::time::sleep(Duration::from_secs(100)).await;
        tracker.stop().await;
        assert!(api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_visibility_is_idempotent() {
        let api = Arc::new(Recorder::default());
        let (visibility, rx) = watch::channel(Visibility::Visible);
        let tracker = PresenceTracker::spawn(api.clone(), "s1".to_string(), rx);
        settle().await;
        visibility.send_replace(Visibility::Visible);
        settle().await;
        visibility.send_replace(Visibility::Hidden);
        settle().await;
        visibility.send_replace(Visibility::Hidden);
        settle().await;
        tracker.stop().await;
        assert_eq!(api.calls(), vec!["join", "leave"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_join_retried_on_tick() {
        let api = Arc::new(Recorder::default());
        *api.fail_joins.lock().unwrap() = 1;
        let (_visibility, rx) = watch::channel(Visibility::Visible);
        let tracker = PresenceTracker::spawn(api.clone(), "s1".to_string(), rx);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(tracker.viewers(), 1);
        tracker.stop().await;
        assert_eq!(api.calls(), vec!["join-failed", "join", "leave"]);
    }
}
