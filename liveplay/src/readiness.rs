use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::SessionError;
use crate::machine::{Delivery, Source};

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const MAX_ATTEMPTS: u32 = 30;

const SEGMENT_EXTENSIONS: [&str; 4] = [".ts", ".m4s", ".mp4", ".aac"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { attempts: u32 },
    /// Bound exceeded, the caller attaches anyway
    TimedOut { attempts: u32 },
}

#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Lightweight existence check
    async fn exists(&self, url: &Url) -> Result<bool, SessionError>;
    async fn fetch(&self, url: &Url) -> Result<String, SessionError>;
}

pub struct HttpManifest {
    client: reqwest::Client,
}

impl HttpManifest {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ManifestSource for HttpManifest {
    async fn exists(&self, url: &Url) -> Result<bool, SessionError> {
        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        Ok(response.status().is_success())
    }

    async fn fetch(&self, url: &Url) -> Result<String, SessionError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SessionError::Negotiation(response.status().as_u16()));
        }
        response
            .text()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }
}

/// Whether a playlist body references at least one media segment, either as
/// a URI line or as a low-latency partial segment.
pub fn has_segments(body: &str) -> bool {
    body.lines()
        .map(str::trim)
        .filter_map(media_uri)
        .any(|uri| {
            let path = uri.split(['?', '#']).next().unwrap_or(uri);
            SEGMENT_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
        })
}

fn media_uri(line: &str) -> Option<&str> {
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('#') {
        return Some(line);
    }
    let attributes = line.strip_prefix("#EXT-X-PART:")?;
    let start = attributes.find("URI=\"")? + "URI=\"".len();
    attributes[start..].split('"').next()
}

pub struct ReadinessPoller {
    source: Arc<dyn ManifestSource>,
    interval: Duration,
    max_attempts: u32,
}

impl ReadinessPoller {
    pub fn new(source: Arc<dyn ManifestSource>) -> Self {
        Self {
            source,
            interval: POLL_INTERVAL,
            max_attempts: MAX_ATTEMPTS,
        }
    }

    /// Only live manifests lag behind the broadcast start.
    pub async fn await_source(&self, source: &Source) -> Readiness {
        match source.delivery {
            Delivery::Manifest if source.live => self.await_ready(&source.url).await,
            _ => Readiness::Ready { attempts: 0 },
        }
    }

    pub async fn await_ready(&self, url: &Url) -> Readiness {
        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.interval).await;
            match self.check(url).await {
                Ok(true) => {
                    info!("manifest {} ready after {} attempts", url, attempt);
                    return Readiness::Ready { attempts: attempt };
                }
                Ok(false) => debug!("manifest {} has no segments yet ({})", url, attempt),
                Err(e) => debug!("manifest {} check {} failed: {}", url, attempt, e),
            }
        }
        warn!(
            "manifest {} not ready after {} attempts, attaching anyway",
            url, self.max_attempts
        );
        Readiness::TimedOut {
            attempts: self.max_attempts,
        }
    }

    async fn check(&self, url: &Url) -> Result<bool, SessionError> {
        if !self.source.exists(url).await? {
            return Ok(false);
        }
        let body = self.source.fetch(url).await?;
        Ok(has_segments(&body))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    const EMPTY: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n";
    const READY: &str =
        "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\nseg0.ts\n#EXTINF:2.0,\nseg1.ts\n";

    /// Gains segments from the given attempt on. When flaky, every second check errors.
    struct Warming {
        ready_at: Option<u32>,
        calls: AtomicU32,
        flaky: bool,
    }

    #[async_trait]
    impl ManifestSource for Warming {
        async fn exists(&self, _url: &Url) -> Result<bool, SessionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.flaky && n % 2 == 0 && Some(n) != self.ready_at {
                return Err(SessionError::Transport("reset".to_string()));
            }
            Ok(true)
        }

        async fn fetch(&self, _url: &Url) -> Result<String, SessionError> {
            let n = self.calls.load(Ordering::SeqCst);
            Ok(match self.ready_at {
                Some(at) if n >= at => READY.to_string(),
                _ => EMPTY.to_string(),
            })
        }
    }

    fn url() -> Url {
        Url::parse("https://cdn.example.com/live/index.m3u8").unwrap()
    }

    fn poller(ready_at: Option<u32>, flaky: bool) -> (ReadinessPoller, Arc<Warming>) {
        let source = Arc::new(Warming {
            ready_at,
            calls: AtomicU32::new(0),
            flaky,
        });
        (ReadinessPoller::new(source.clone()), source)
    }

    #[test]
    fn test_has_segments() {
        assert!(!has_segments(EMPTY));
        assert!(has_segments(READY));
        assert!(has_segments("#EXTM3U\n#EXTINF:2,\nchunk_3.m4s?token=abc\n"));
        assert!(has_segments("#EXTM3U\n#EXTINF:2,\nhttps://cdn/a/0.aac\n"));
        // A variant playlist reference is not media.
        assert!(!has_segments("#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nlow.m3u8\n"));
        assert!(!has_segments("#EXT-X-MAP:URI=\"init.mp4\"\n"));
    }

    #[test]
    fn test_partial_segments_count_as_media() {
        let low_latency = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-PART-INF:PART-TARGET=1.0\n\
                           #EXT-X-MAP:URI=\"init.mp4\"\n\
                           #EXT-X-PART:DURATION=1.0,URI=\"part0.m4s?_HLS_part=0\",INDEPENDENT=YES\n";
        assert!(has_segments(low_latency));
        assert!(!has_segments(
            "#EXTM3U\n#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"part1.m4s\"\n"
        ));
        assert!(!has_segments("#EXTM3U\n#EXT-X-PART:DURATION=1.0\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_at_attempt_n() {
        for n in [1, 7, 29] {
            let (poller, source) = poller(Some(n), false);
            let started = tokio::time::Instant::now();
            assert_eq!(
                poller.await_ready(&url()).await,
                Readiness::Ready { attempts: n }
            );
            assert_eq!(source.calls.load(Ordering::SeqCst), n);
            assert_eq!(started.elapsed(), POLL_INTERVAL * n);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_at_thirty() {
        let (poller, source) = poller(None, false);
        let started = tokio::time::Instant::now();
        assert_eq!(
            poller.await_ready(&url()).await,
            Readiness::TimedOut { attempts: 30 }
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 30);
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_counts_toward_budget() {
        let (poller, source) = poller(Some(5), true);
        assert_eq!(
            poller.await_ready(&url()).await,
            Readiness::Ready { attempts: 5 }
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_manifest_is_immediately_ready() {
        let (poller, source) = poller(None, false);
        let whep = Source::new(
            Url::parse("https://media.example.com/whep/a").unwrap(),
            Delivery::Whep,
            true,
        );
        let vod = Source::new(url(), Delivery::Manifest, false);
        assert_eq!(
            poller.await_source(&whep).await,
            Readiness::Ready { attempts: 0 }
        );
        assert_eq!(
            poller.await_source(&vod).await,
            Readiness::Ready { attempts: 0 }
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
