use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::ArgAction;
use liveplay::capture::LocalTrack;
use liveplay::heartbeat::{HeartbeatHandle, LivenessHeartbeat};
use liveplay::{
    DefaultConnector, Delivery, MediaSession, Notice, OutputSink, SharedCapture, Signaling, Source,
    State,
};
use tokio::net::UdpSocket;
use tracing::{error, info, trace, warn};
use url::Url;
use webrtc::track::track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocalWriter};

use crate::codec::Codec;
use crate::play::IceArgs;

#[derive(clap::Args)]
pub struct Args {
    /// Verbose mode [default: "warn", -v "info", -vv "debug", -vvv "trace"]
    #[arg(short = 'v', action = ArgAction::Count, default_value_t = 0)]
    pub verbose: u8,
    /// The WHIP server endpoint to POST SDP offer to. e.g.: https://example.com/whip/777
    whip: Url,
    /// Authentication token to use, will be sent in the HTTP Header as 'Bearer '
    #[arg(short, long)]
    token: Option<String>,
    /// Local UDP address receiving RTP
    #[arg(short, long, default_value = "127.0.0.1:5004")]
    input: String,
    #[arg(short, long, value_enum, default_value_t = Codec::Vp8)]
    codec: Codec,
    #[command(flatten)]
    ice: IceArgs,
    /// Liveness server to heartbeat while publishing
    #[arg(long, requires_all = ["stream_id", "session_token", "wallet"])]
    server: Option<Url>,
    #[arg(long)]
    stream_id: Option<String>,
    #[arg(long)]
    session_token: Option<String>,
    #[arg(long)]
    wallet: Option<String>,
}

pub async fn run(args: Args) -> Result<()> {
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()?;

    let track = Arc::new(TrackLocalStaticRTP::new(
        args.codec.into(),
        format!("livecast-{}", args.codec.kind()),
        "livecast".to_owned(),
    ));
    let local: LocalTrack = track.clone();
    let (capture, authority) = SharedCapture::new(vec![local]);
    let socket = UdpSocket::bind(&args.input).await?;
    info!("=== RTP listener started : {} ===", socket.local_addr()?);
    tokio::spawn(forward_rtp(socket, track, capture.clone()));

    let signaling = Signaling::new(http.clone(), args.token.clone(), args.ice.source(&args.whip)?);
    let connector = DefaultConnector::new(http.clone(), signaling).with_capture(capture.clone());
    let (sink, _frames) = OutputSink::new();
    let (ready_tx, mut ready_rx) = tokio::sync::mpsc::unbounded_channel();
    let session = MediaSession::spawn(
        Arc::new(connector),
        sink,
        Box::new(move || {
            info!("=== Publishing ===");
            let _ = ready_tx.send(());
        }),
    );
    session.adopt_capture(authority);
    let mut notices = session.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice {
                Notice::Reconnecting { attempt, max } => {
                    warn!("=== Reconnecting ({}/{}) ===", attempt, max)
                }
                Notice::Unrecoverable(reason) => error!("=== Publish failed: {} ===", reason),
                Notice::NotReadyYet => {}
            }
        }
    });
    session.start(Source::new(args.whip.clone(), Delivery::Whip, true));

    let heartbeat = match (args.server, args.stream_id, args.session_token, args.wallet) {
        (Some(server), Some(stream_id), Some(token), Some(wallet)) => {
            Some(LivenessHeartbeat::new(http, server, token, wallet, stream_id))
        }
        _ => None,
    };

    let mut beating: Option<HeartbeatHandle> = None;
    let terminal = session.wait_terminal();
    let signal = crate::shutdown_signal();
    tokio::pin!(terminal, signal);
    let result = loop {
        tokio::select! {
            Some(()) = ready_rx.recv() => {
                if let Some(heartbeat) = heartbeat.clone() {
                    if beating.is_none() {
                        beating = Some(heartbeat.spawn());
                    }
                }
            }
            state = &mut terminal => break match state {
                State::Failed(reason) => Err(anyhow!(reason)),
                _ => Ok(()),
            },
            _ = &mut signal => break Ok(()),
        }
    };

    if let Some(beating) = beating {
        info!("heartbeat ended: {:?}", beating.stop().await);
    }
    session.stop().await;
    result
}

async fn forward_rtp(socket: UdpSocket, track: Arc<TrackLocalStaticRTP>, capture: SharedCapture) {
    let mut buf = vec![0u8; 1500];
    loop {
        tokio::select! {
            res = socket.recv_from(&mut buf) => match res {
                Ok((n, _)) => {
                    trace!("received {} bytes of rtp", n);
                    if let Err(e) = track.write(&buf[..n]).await {
                        trace!("track write failed: {}", e);
                    }
                }
                Err(e) => {
                    error!("Error receiving RTP data: {}", e);
                    return;
                }
            },
            _ = capture.released() => {
                info!("=== Capture released, RTP listener stopped ===");
                return;
            }
        }
    }
}
