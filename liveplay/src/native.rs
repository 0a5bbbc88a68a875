use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{info, warn};
use url::Url;

use crate::error::SessionError;
use crate::machine::MediaEvent;
use crate::sink::SinkLease;
use crate::transport::{Attachment, MediaTransport};

/// A playback element that understands playlists on its own.
#[async_trait]
pub trait NativePlayback: Send + Sync {
    async fn load(&self, manifest: &Url, lease: SinkLease) -> Result<Attachment, SessionError>;
}

/// Hands the manifest to an external player, e.g. `ffplay` or `mpv`.
pub struct ProcessPlayback {
    program: String,
    args: Vec<String>,
}

impl ProcessPlayback {
    pub fn new(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl NativePlayback for ProcessPlayback {
    async fn load(&self, manifest: &Url, lease: SinkLease) -> Result<Attachment, SessionError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(manifest.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Media(format!("{}: {}", self.program, e)))?;
        info!("started {} for {}", self.program, manifest);

        let (tx, events) = unbounded_channel();
        let _ = tx.send(MediaEvent::Playing);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        let watcher = tokio::spawn(watch_child(child, tx, stop_rx));
        Ok(Attachment {
            transport: Box::new(PlayerProcess {
                stop: Some(stop_tx),
                watcher: Some(watcher),
                lease: Some(lease),
            }),
            events,
        })
    }
}

struct PlayerProcess {
    stop: Option<tokio::sync::oneshot::Sender<()>>,
    watcher: Option<tokio::task::JoinHandle<()>>,
    lease: Option<SinkLease>,
}

#[async_trait]
impl MediaTransport for PlayerProcess {
    async fn recover(&mut self) -> Result<(), SessionError> {
        // The player buffers and recovers on its own.
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.await;
        }
        self.lease = None;
    }
}

async fn watch_child(
    mut child: Child,
    events: UnboundedSender<MediaEvent>,
    stop: tokio::sync::oneshot::Receiver<()>,
) {
    tokio::select! {
        status = child.wait() => {
            let error = match status {
                Ok(status) if status.success() => return,
                Ok(status) => SessionError::Transport(format!("player exited with {}", status)),
                Err(e) => SessionError::Media(e.to_string()),
            };
            warn!("{}", error);
            let _ = events.send(MediaEvent::Fatal(error));
        }
        _ = stop => {
            if let Err(e) = child.kill().await {
                warn!("failed to stop player: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_split() {
        let player = ProcessPlayback::new("mpv --no-video  --really-quiet").unwrap();
        assert_eq!(player.program, "mpv");
        assert_eq!(player.args, vec!["--no-video", "--really-quiet"]);
        assert!(ProcessPlayback::new("   ").is_none());
    }
}
