use clap::ValueEnum;
use webrtc::{api::media_engine::*, rtp_transceiver::rtp_codec::RTCRtpCodecCapability};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Codec {
    Vp8,
    Vp9,
    H264,
    AV1,
    Opus,
}

impl Codec {
    pub fn kind(&self) -> &'static str {
        match self {
            Codec::Opus => "audio",
            _ => "video",
        }
    }
}

impl From<Codec> for RTCRtpCodecCapability {
    fn from(codec: Codec) -> Self {
        let (mime_type, clock_rate, channels, sdp_fmtp_line) = match codec {
            Codec::Vp8 => (MIME_TYPE_VP8, 90000, 0, ""),
            Codec::Vp9 => (MIME_TYPE_VP9, 90000, 0, "profile-id=0"),
            Codec::H264 => (
                MIME_TYPE_H264,
                90000,
                0,
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f",
            ),
            Codec::AV1 => (MIME_TYPE_AV1, 90000, 0, "profile-id=0"),
            Codec::Opus => (MIME_TYPE_OPUS, 48000, 2, "minptime=10;useinbandfec=1"),
        };
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            clock_rate,
            channels,
            sdp_fmtp_line: sdp_fmtp_line.to_owned(),
            rtcp_feedback: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability() {
        let cap: RTCRtpCodecCapability = Codec::Opus.into();
        assert_eq!(cap.mime_type, MIME_TYPE_OPUS);
        assert_eq!(cap.clock_rate, 48000);
        assert_eq!(Codec::Opus.kind(), "audio");
        assert_eq!(Codec::H264.kind(), "video");
    }
}
