use std::sync::Arc;
use std::time::Duration;

use iceserver::IceServer;
use libwish::Client;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;
use webrtc::{
    api::{interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder},
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, sdp::session_description::RTCSessionDescription,
        RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::RTPCodecType, rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCRtpTransceiverInit,
    },
};

use crate::capture::LocalTrack;
use crate::error::SessionError;
use crate::peer::PeerTransport;
use crate::sink::SinkLease;
use crate::transport::Attachment;

pub const ICE_GATHER_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Broadcast
    SendOnly,
    /// Playback
    RecvOnly,
}

/// Where ICE servers for a negotiation come from.
#[derive(Debug, Clone, Default)]
pub enum IceSource {
    /// Fixed list, including shared-literal credentials when explicitly chosen
    Static(Vec<IceServer>),
    /// Ephemeral coturn REST credentials for `stun:`/`turn:` on the media host
    Coturn { secret: String, ttl: Duration },
    /// Ask the endpoint with OPTIONS, fall back to STUN on the media host
    #[default]
    Discover,
}

impl IceSource {
    pub async fn resolve(&self, client: &Client, endpoint: &Url) -> Vec<IceServer> {
        match self {
            IceSource::Static(servers) => servers.clone(),
            IceSource::Coturn { secret, ttl } => {
                let expiry = iceserver::coturn::expiry_timestamp(*ttl);
                let credentials = iceserver::coturn::generate_credentials(secret, expiry, None);
                iceserver::host_servers(endpoint, Some(credentials))
            }
            IceSource::Discover => match client.ice_servers().await {
                Ok(servers) if !servers.is_empty() => servers,
                Ok(_) => iceserver::host_servers(endpoint, None),
                Err(e) => {
                    debug!("ice server discovery failed: {}", e);
                    iceserver::host_servers(endpoint, None)
                }
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Succeeded,
    Failed(SessionError),
}

/// One offer/answer/ICE cycle. A retry always builds a fresh one.
#[derive(Debug, Clone)]
pub struct NegotiationAttempt {
    pub local_description: Option<String>,
    pub remote_description: Option<String>,
    pub ice_gathering_deadline: Instant,
    pub outcome: Outcome,
}

impl NegotiationAttempt {
    fn new(deadline: Duration) -> Self {
        Self {
            local_description: None,
            remote_description: None,
            ice_gathering_deadline: Instant::now() + deadline,
            outcome: Outcome::Pending,
        }
    }
}

#[derive(Clone)]
pub struct Signaling {
    http: reqwest::Client,
    token: Option<String>,
    ice: IceSource,
    gather_deadline: Duration,
}

impl Signaling {
    pub fn new(http: reqwest::Client, token: Option<String>, ice: IceSource) -> Self {
        Self {
            http,
            token,
            ice,
            gather_deadline: ICE_GATHER_DEADLINE,
        }
    }

    pub fn with_gather_deadline(mut self, deadline: Duration) -> Self {
        self.gather_deadline = deadline;
        self
    }

    /// Opens exactly one connection. On success the caller owns it through
    /// the returned transport; on failure it is already closed.
    pub async fn negotiate(
        &self,
        direction: Direction,
        endpoint: &Url,
        tracks: &[LocalTrack],
        lease: SinkLease,
    ) -> Result<Attachment, SessionError> {
        let mut attempt = NegotiationAttempt::new(self.gather_deadline);
        let mut client = Client::with_http(
            self.http.clone(),
            endpoint.to_string(),
            Client::get_auth_header_map(self.token.clone()),
        );

        let ice_servers = self.ice.resolve(&client, endpoint).await;
        debug!("ice servers for {}: {:?}", endpoint, ice_servers);
        let peer = new_peer(ice_servers).await?;

        match self
            .exchange(&peer, &mut client, direction, tracks, &mut attempt)
            .await
        {
            Ok(()) => {
                attempt.outcome = Outcome::Succeeded;
                info!("negotiated {:?} with {}", direction, endpoint);
                Ok(PeerTransport::attach(peer, client, direction, lease, attempt))
            }
            Err(e) => {
                attempt.outcome = Outcome::Failed(e.clone());
                warn!("negotiation with {} failed: {}", endpoint, e);
                let _ = peer.close().await;
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        peer: &Arc<RTCPeerConnection>,
        client: &mut Client,
        direction: Direction,
        tracks: &[LocalTrack],
        attempt: &mut NegotiationAttempt,
    ) -> Result<(), SessionError> {
        match direction {
            Direction::RecvOnly => {
                for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
                    peer.add_transceiver_from_kind(
                        kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await?;
                }
            }
            Direction::SendOnly => {
                if tracks.is_empty() {
                    return Err(SessionError::Protocol("nothing to publish".to_string()));
                }
                for track in tracks {
                    let sender = peer.add_track(track.clone()).await?;
                    // Drain RTCP so interceptors keep running.
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 1500];
                        while sender.read(&mut buf).await.is_ok() {}
                    });
                }
            }
        }

        let offer = peer.create_offer(None).await?;
        let mut gather_complete = peer.gathering_complete_promise().await;
        peer.set_local_description(offer).await?;
        if tokio::time::timeout_at(attempt.ice_gathering_deadline, gather_complete.recv())
            .await
            .is_err()
        {
            warn!("ice gathering incomplete at deadline, sending current candidates");
        }

        let local = peer
            .local_description()
            .await
            .ok_or_else(|| SessionError::Protocol("no local description".to_string()))?;
        attempt.local_description = Some(local.sdp.clone());

        let (answer, ice_servers) = client.wish(local.sdp).await?;
        debug!("link header ice servers: {:?}", ice_servers);
        if !ice_servers.is_empty() {
            let mut config = peer.get_configuration().await;
            config.ice_servers = ice_servers.into_iter().map(Into::into).collect();
            peer.set_configuration(config).await?;
        }

        let remote = RTCSessionDescription::answer(answer.clone())
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        peer.set_remote_description(remote)
            .await
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        attempt.remote_description = Some(answer);
        Ok(())
    }
}

async fn new_peer(ice_servers: Vec<IceServer>) -> Result<Arc<RTCPeerConnection>, SessionError> {
    let mut m = MediaEngine::default();
    m.register_default_codecs()?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut m)?;
    let api = APIBuilder::new()
        .with_media_engine(m)
        .with_interceptor_registry(registry)
        .build();
    let config = RTCConfiguration {
        ice_servers: ice_servers.into_iter().map(Into::into).collect(),
        ..Default::default()
    };
    Ok(Arc::new(api.new_peer_connection(config).await?))
}
