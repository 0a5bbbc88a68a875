use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use libwish::Client;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, trace, warn};
use webrtc::{
    peer_connection::{peer_connection_state::RTCPeerConnectionState, RTCPeerConnection},
    rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication,
    rtp_transceiver::rtp_codec::RTPCodecType,
    track::track_remote::TrackRemote,
    util::MarshalSize,
};

use crate::error::SessionError;
use crate::machine::MediaEvent;
use crate::signaling::{Direction, NegotiationAttempt};
use crate::sink::{Frame, MediaKind, SinkLease, SinkWriter};
use crate::transport::{Attachment, MediaTransport};

/// No packet for this long counts as a stall.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(3);

/// A negotiated peer connection attached to an output sink.
pub struct PeerTransport {
    peer: Arc<RTCPeerConnection>,
    client: Client,
    lease: Option<SinkLease>,
    ssrcs: Arc<Mutex<Vec<u32>>>,
    attempt: NegotiationAttempt,
}

impl PeerTransport {
    pub(crate) fn attach(
        peer: Arc<RTCPeerConnection>,
        client: Client,
        direction: Direction,
        lease: SinkLease,
        attempt: NegotiationAttempt,
    ) -> Attachment {
        let (tx, events) = unbounded_channel();
        let ssrcs = Arc::new(Mutex::new(Vec::new()));
        watch_state(&peer, direction, tx.clone());
        if direction == Direction::RecvOnly {
            forward_tracks(&peer, lease.writer(), ssrcs.clone(), tx);
        }
        Attachment {
            transport: Box::new(PeerTransport {
                peer,
                client,
                lease: Some(lease),
                ssrcs,
                attempt,
            }),
            events,
        }
    }

    pub fn attempt(&self) -> &NegotiationAttempt {
        &self.attempt
    }
}

#[async_trait]
impl MediaTransport for PeerTransport {
    async fn recover(&mut self) -> Result<(), SessionError> {
        let ssrcs = self
            .ssrcs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for media_ssrc in ssrcs {
            self.peer
                .write_rtcp(&[Box::new(PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc,
                })])
                .await
                .map_err(|e| SessionError::Media(e.to_string()))?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.lease.is_none() {
            return;
        }
        if let Err(e) = self.client.remove_resource().await {
            warn!("failed to delete resource: {}", e);
        }
        if let Err(e) = self.peer.close().await {
            warn!("failed to close peer connection: {}", e);
        }
        self.lease = None;
    }
}

fn watch_state(
    peer: &Arc<RTCPeerConnection>,
    direction: Direction,
    events: UnboundedSender<MediaEvent>,
) {
    peer.on_peer_connection_state_change(Box::new(move |s| {
        debug!("connection state changed: {}", s);
        let event = match s {
            // A publisher has no inbound frames; connected is its ready signal.
            RTCPeerConnectionState::Connected if direction == Direction::SendOnly => {
                Some(MediaEvent::Playing)
            }
            RTCPeerConnectionState::Disconnected => Some(MediaEvent::Stall),
            RTCPeerConnectionState::Failed => Some(MediaEvent::Fatal(SessionError::Transport(
                "peer connection failed".to_string(),
            ))),
            _ => None,
        };
        if let Some(event) = event {
            let _ = events.send(event);
        }
        Box::pin(async {})
    }));
}

fn forward_tracks(
    peer: &Arc<RTCPeerConnection>,
    writer: SinkWriter,
    ssrcs: Arc<Mutex<Vec<u32>>>,
    events: UnboundedSender<MediaEvent>,
) {
    let playing = Arc::new(AtomicBool::new(false));
    peer.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => Some(MediaKind::Video),
            RTPCodecType::Audio => Some(MediaKind::Audio),
            _ => None,
        };
        if let Some(kind) = kind {
            ssrcs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(track.ssrc());
            tokio::spawn(read_track(
                track,
                kind,
                writer.clone(),
                events.clone(),
                playing.clone(),
            ));
        }
        Box::pin(async {})
    }));
}

async fn read_track(
    track: Arc<TrackRemote>,
    kind: MediaKind,
    writer: SinkWriter,
    events: UnboundedSender<MediaEvent>,
    playing: Arc<AtomicBool>,
) {
    let mut b = [0u8; 1500];
    loop {
        match tokio::time::timeout(STALL_TIMEOUT, track.read(&mut b)).await {
            Ok(Ok((rtp_packet, _))) => {
                trace!("received rtp packet: {:?}", rtp_packet.header);
                let size = rtp_packet.marshal_size();
                let packet = Bytes::copy_from_slice(&b[..size]);
                if !writer.write(Frame::Rtp { kind, packet }) {
                    break;
                }
                if !playing.swap(true, Ordering::SeqCst) {
                    let _ = events.send(MediaEvent::Playing);
                }
            }
            Ok(Err(e)) => {
                debug!("track {:?} ended: {}", kind, e);
                break;
            }
            Err(_) => {
                if playing.swap(false, Ordering::SeqCst) {
                    let _ = events.send(MediaEvent::Stall);
                }
            }
        }
    }
}
