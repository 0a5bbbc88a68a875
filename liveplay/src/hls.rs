use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::SessionError;
use crate::machine::MediaEvent;
use crate::sink::{Frame, SinkLease, SinkWriter};
use crate::transport::{Attachment, MediaTransport};

/// Consecutive playlist failures before the loader reports a fatal error.
const MAX_PLAYLIST_FAILURES: u32 = 3;
/// Segments behind the live edge to start from.
const LIVE_EDGE_SEGMENTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub sequence: u64,
    pub uri: Url,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Playlist {
    pub target_duration: Option<u64>,
    pub segments: Vec<Segment>,
    /// First variant of a master playlist
    pub variant: Option<Url>,
    pub ended: bool,
}

impl Playlist {
    pub fn parse(base: &Url, body: &str) -> Self {
        let mut playlist = Playlist::default();
        let mut sequence = 0;
        let mut expect_variant = false;
        for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
                sequence = rest.parse().unwrap_or(0);
            } else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                playlist.target_duration = rest.parse().ok();
            } else if line.starts_with("#EXT-X-STREAM-INF") {
                expect_variant = true;
            } else if line == "#EXT-X-ENDLIST" {
                playlist.ended = true;
            } else if line.starts_with('#') {
                continue;
            } else if let Ok(uri) = base.join(line) {
                if expect_variant {
                    if playlist.variant.is_none() {
                        playlist.variant = Some(uri);
                    }
                    expect_variant = false;
                } else {
                    playlist.segments.push(Segment { sequence, uri });
                    sequence += 1;
                }
            }
        }
        playlist
    }

    fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.target_duration.unwrap_or(2).clamp(1, 10))
    }
}

enum Control {
    Recover,
}

/// Software playlist loader: follows the playlist and feeds segments into
/// the sink in order.
pub struct HlsLoader {
    control: UnboundedSender<Control>,
    task: Option<JoinHandle<()>>,
    lease: Option<SinkLease>,
}

impl HlsLoader {
    pub fn start(http: reqwest::Client, manifest: Url, lease: SinkLease) -> Attachment {
        let (events_tx, events) = unbounded_channel();
        let (control, control_rx) = unbounded_channel();
        let task = tokio::spawn(run(http, manifest, lease.writer(), events_tx, control_rx));
        Attachment {
            transport: Box::new(HlsLoader {
                control,
                task: Some(task),
                lease: Some(lease),
            }),
            events,
        }
    }
}

#[async_trait]
impl MediaTransport for HlsLoader {
    async fn recover(&mut self) -> Result<(), SessionError> {
        self.control
            .send(Control::Recover)
            .map_err(|_| SessionError::Media("loader stopped".to_string()))
    }

    async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.lease = None;
    }
}

impl Drop for HlsLoader {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    http: reqwest::Client,
    manifest: Url,
    writer: SinkWriter,
    events: UnboundedSender<MediaEvent>,
    mut control: UnboundedReceiver<Control>,
) {
    let mut playlist_url = manifest;
    let mut next: Option<u64> = None;
    let mut failures = 0;
    let mut playing = false;

    loop {
        let mut interval = Duration::from_secs(2);
        match fetch(&http, &playlist_url).await {
            Ok(body) => {
                failures = 0;
                let playlist = Playlist::parse(&playlist_url, &String::from_utf8_lossy(&body));
                if let Some(variant) = playlist.variant.clone().filter(|v| *v != playlist_url) {
                    debug!("following variant {}", variant);
                    playlist_url = variant;
                    continue;
                }
                interval = playlist.refresh_interval();

                let start = next.unwrap_or_else(|| start_sequence(&playlist));
                for segment in playlist.segments.iter().filter(|s| s.sequence >= start) {
                    match fetch(&http, &segment.uri).await {
                        Ok(data) => {
                            if !writer.write(Frame::Segment {
                                uri: segment.uri.to_string(),
                                data,
                            }) {
                                return;
                            }
                            next = Some(segment.sequence + 1);
                            if !playing {
                                playing = true;
                                let _ = events.send(MediaEvent::Playing);
                            }
                        }
                        Err(e) => {
                            warn!("segment {} failed: {}", segment.uri, e);
                            playing = false;
                            let _ = events.send(MediaEvent::DecodeError(e.to_string()));
                            break;
                        }
                    }
                }

                let delivered = match (next, playlist.segments.last()) {
                    (Some(n), Some(last)) => n > last.sequence,
                    _ => false,
                };
                if playlist.ended && delivered {
                    info!("playlist {} finished", playlist_url);
                    return;
                }
            }
            Err(e) => {
                failures += 1;
                warn!("playlist {} failed ({}): {}", playlist_url, failures, e);
                if failures >= MAX_PLAYLIST_FAILURES {
                    let _ = events.send(MediaEvent::Fatal(e));
                    return;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            msg = control.recv() => match msg {
                Some(Control::Recover) => {
                    info!("recovering: jumping to live edge");
                    next = None;
                }
                None => return,
            }
        }
    }
}

fn start_sequence(playlist: &Playlist) -> u64 {
    let skip = if playlist.ended {
        0
    } else {
        playlist.segments.len().saturating_sub(LIVE_EDGE_SEGMENTS)
    };
    playlist
        .segments
        .get(skip)
        .map(|s| s.sequence)
        .unwrap_or(0)
}

async fn fetch(http: &reqwest::Client, url: &Url) -> Result<Bytes, SessionError> {
    let response = http
        .get(url.clone())
        .send()
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;
    if !response.status().is_success() {
        return Err(SessionError::Negotiation(response.status().as_u16()));
    }
    response
        .bytes()
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))
}
