use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Marshalled RTP packet
    Rtp { kind: MediaKind, packet: Bytes },
    Segment { uri: String, data: Bytes },
}

/// Destination of decoded media. Admits one attached transport at a time.
#[derive(Clone)]
pub struct OutputSink {
    slot: Arc<Semaphore>,
    frames: mpsc::UnboundedSender<Frame>,
}

impl OutputSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (frames, rx) = mpsc::unbounded_channel();
        (
            Self {
                slot: Arc::new(Semaphore::new(1)),
                frames,
            },
            rx,
        )
    }

    /// Waits until the previous transport has released the sink.
    pub async fn acquire(&self) -> Result<SinkLease, SessionError> {
        let permit = self
            .slot
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SessionError::Media("output sink closed".to_string()))?;
        Ok(SinkLease::new(permit, self.frames.clone()))
    }

    pub fn try_acquire(&self) -> Option<SinkLease> {
        let permit = self.slot.clone().try_acquire_owned().ok()?;
        Some(SinkLease::new(permit, self.frames.clone()))
    }

    pub fn is_attached(&self) -> bool {
        self.slot.available_permits() == 0
    }
}

/// Exclusive right to write into an [`OutputSink`]; released on drop.
pub struct SinkLease {
    _permit: OwnedSemaphorePermit,
    writer: SinkWriter,
}

impl SinkLease {
    fn new(permit: OwnedSemaphorePermit, frames: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            _permit: permit,
            writer: SinkWriter {
                frames,
                detached: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    pub fn writer(&self) -> SinkWriter {
        self.writer.clone()
    }

    pub fn write(&self, frame: Frame) -> bool {
        self.writer.write(frame)
    }
}

impl Drop for SinkLease {
    fn drop(&mut self) {
        self.writer.detached.store(true, Ordering::SeqCst);
    }
}

/// Handle for media tasks; writes after the lease is gone are dropped.
#[derive(Clone)]
pub struct SinkWriter {
    frames: mpsc::UnboundedSender<Frame>,
    detached: Arc<AtomicBool>,
}

impl SinkWriter {
    pub fn write(&self, frame: Frame) -> bool {
        if self.detached.load(Ordering::SeqCst) {
            return false;
        }
        self.frames.send(frame).is_ok()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn rtp(b: &'static [u8]) -> Frame {
        Frame::Rtp {
            kind: MediaKind::Video,
            packet: Bytes::from_static(b),
        }
    }

    #[tokio::test]
    async fn test_single_lease() {
        let (sink, mut rx) = OutputSink::new();
        let lease = sink.acquire().await.unwrap();
        assert!(sink.is_attached());
        assert!(sink.try_acquire().is_none());

        assert!(lease.write(rtp(b"a")));
        assert_eq!(rx.recv().await, Some(rtp(b"a")));

        drop(lease);
        assert!(!sink.is_attached());
        assert!(sink.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_stale_writer_is_cut_off() {
        let (sink, mut rx) = OutputSink::new();
        let lease = sink.acquire().await.unwrap();
        let writer = lease.writer();
        drop(lease);

        let next = sink.acquire().await.unwrap();
        assert!(writer.is_detached());
        assert!(!writer.write(rtp(b"old")));
        assert!(next.write(rtp(b"new")));
        assert_eq!(rx.recv().await, Some(rtp(b"new")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_release() {
        let (sink, _rx) = OutputSink::new();
        let lease = sink.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let sink = sink.clone();
            async move { sink.acquire().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        drop(lease);
        assert!(waiter.await.unwrap().is_ok());
    }
}
