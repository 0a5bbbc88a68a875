use serde::{Deserialize, Serialize};

/// Body the media provider POSTs to us.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProviderWebhook {
    pub event: String,
    #[serde(default)]
    pub stream: Option<ProviderStream>,
}

pub const EVENT_STREAM_STARTED: &str = "stream.started";
pub const EVENT_STREAM_IDLE: &str = "stream.idle";
pub const EVENT_RECORDING_READY: &str = "recording.ready";

/// Provider-side view of a stream, shared by the webhook body and the status API.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStream {
    pub id: String,
    #[serde(default)]
    pub is_active: bool,
    /// Unix milliseconds of the last ingest activity the provider saw
    #[serde(default)]
    pub last_seen: Option<i64>,
    #[serde(default)]
    pub playback_id: Option<String>,
    #[serde(default)]
    pub recording_playback_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SignalSource {
    Webhook,
    Poll,
    Heartbeat,
    ClientStop,
    Sweep,
}

/// Published on every live/not-live edge.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LivenessEvent {
    pub stream_id: String,
    pub is_live: bool,
    pub source: SignalSource,
    pub last_heartbeat: i64,
    pub ended_at: Option<i64>,
}
