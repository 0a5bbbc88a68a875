use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{ArgAction, ValueEnum};
use iceserver::IceServer;
use liveplay::native::ProcessPlayback;
use liveplay::presence::{HttpPresence, PresenceTracker, Visibility};
use liveplay::{
    DefaultConnector, Delivery, Frame, IceSource, MediaSession, Notice, OutputSink, Signaling,
    Source, State,
};
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc::UnboundedReceiver, watch};
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Kind {
    Whep,
    Hls,
}

#[derive(clap::Args)]
pub struct Args {
    /// Verbose mode [default: "warn", -v "info", -vv "debug", -vvv "trace"]
    #[arg(short = 'v', action = ArgAction::Count, default_value_t = 0)]
    pub verbose: u8,
    /// WHEP endpoint or playlist url
    url: Url,
    #[arg(long, value_enum, default_value_t = Kind::Whep)]
    kind: Kind,
    /// On-demand source: no reconnects
    #[arg(long)]
    vod: bool,
    /// Authentication token to use, will be sent in the HTTP Header as 'Bearer '
    #[arg(short, long)]
    token: Option<String>,
    /// Hand playlists to this player instead of loading them, e.g. "ffplay -loglevel error"
    #[arg(long)]
    native_player: Option<String>,
    /// Forward received RTP to this UDP address
    #[arg(long)]
    rtp_to: Option<String>,
    /// Append received segments to this file
    #[arg(long)]
    segments_to: Option<String>,
    #[command(flatten)]
    pub ice: IceArgs,
    /// Liveness server, counts this viewer while playing
    #[arg(long, requires = "stream_id")]
    server: Option<Url>,
    #[arg(long)]
    stream_id: Option<String>,
}

#[derive(clap::Args)]
pub struct IceArgs {
    /// coturn REST secret for ephemeral TURN credentials on the media host
    #[arg(long, conflicts_with = "ice_static")]
    pub ice_secret: Option<String>,
    /// Fixed "username:credential" for STUN/TURN on the media host
    #[arg(long)]
    pub ice_static: Option<String>,
}

impl IceArgs {
    pub fn source(&self, endpoint: &Url) -> Result<IceSource> {
        if let Some(secret) = &self.ice_secret {
            return Ok(IceSource::Coturn {
                secret: secret.clone(),
                ttl: Duration::from_secs(24 * 3600),
            });
        }
        if let Some(fixed) = &self.ice_static {
            let (username, credential) = fixed
                .split_once(':')
                .ok_or_else(|| anyhow!("--ice-static expects username:credential"))?;
            warn!("using shared TURN credentials, every client can use this relay");
            let servers: Vec<IceServer> = iceserver::host_servers(
                endpoint,
                Some((username.to_string(), credential.to_string())),
            );
            return Ok(IceSource::Static(servers));
        }
        Ok(IceSource::Discover)
    }
}

pub async fn run(args: Args) -> Result<()> {
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()?;
    let signaling = Signaling::new(http.clone(), args.token.clone(), args.ice.source(&args.url)?);
    let mut connector = DefaultConnector::new(http.clone(), signaling);
    if let Some(command) = &args.native_player {
        let player =
            ProcessPlayback::new(command).ok_or_else(|| anyhow!("empty --native-player"))?;
        connector = connector.with_native(Arc::new(player));
    }

    let (sink, frames) = OutputSink::new();
    tokio::spawn(drain(frames, args.rtp_to.clone(), args.segments_to.clone()));

    let session = MediaSession::spawn(
        Arc::new(connector),
        sink,
        Box::new(|| info!("=== Stream ready ===")),
    );
    let mut notices = session.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice {
                Notice::Reconnecting { attempt, max } => {
                    warn!("=== Reconnecting ({}/{}) ===", attempt, max)
                }
                Notice::Unrecoverable(reason) => error!("=== Playback failed: {} ===", reason),
                Notice::NotReadyYet => warn!("=== Stream is not ready yet, trying anyway ==="),
            }
        }
    });

    let delivery = match args.kind {
        Kind::Whep => Delivery::Whep,
        Kind::Hls => Delivery::Manifest,
    };
    session.start(Source::new(args.url.clone(), delivery, !args.vod));

    let (_visible, visibility) = watch::channel(Visibility::Visible);
    let presence = match (&args.server, &args.stream_id) {
        (Some(server), Some(stream_id)) => Some(PresenceTracker::spawn(
            Arc::new(HttpPresence::new(http.clone(), server.clone())),
            stream_id.clone(),
            visibility,
        )),
        _ => None,
    };

    let result = tokio::select! {
        state = session.wait_terminal() => match state {
            State::Failed(reason) => Err(anyhow!(reason)),
            _ => Ok(()),
        },
        _ = crate::shutdown_signal() => Ok(()),
    };

    if let Some(presence) = presence {
        presence.stop().await;
    }
    session.stop().await;
    result
}

async fn drain(
    mut frames: UnboundedReceiver<Frame>,
    rtp_to: Option<String>,
    segments_to: Option<String>,
) {
    let socket = match &rtp_to {
        Some(_) => match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => Some(s),
            Err(e) => {
                error!("Failed to bind UDP socket: {}", e);
                None
            }
        },
        None => None,
    };
    let mut file = match &segments_to {
        Some(path) => match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
        {
            Ok(f) => Some(f),
            Err(e) => {
                error!("Failed to open {}: {}", path, e);
                None
            }
        },
        None => None,
    };

    while let Some(frame) = frames.recv().await {
        match frame {
            Frame::Rtp { kind, packet } => {
                if let (Some(socket), Some(addr)) = (&socket, &rtp_to) {
                    if let Err(e) = socket.send_to(&packet, addr).await {
                        error!("Failed to send data to {}: {}", addr, e);
                    }
                } else {
                    debug!("{:?} packet {} bytes", kind, packet.len());
                }
            }
            Frame::Segment { uri, data } => {
                debug!("segment {} ({} bytes)", uri, data.len());
                if let Some(file) = file.as_mut() {
                    if let Err(e) = file.write_all(&data).await {
                        error!("Failed to write segment: {}", e);
                    }
                }
            }
        }
    }
}
