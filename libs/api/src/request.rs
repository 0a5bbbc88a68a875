use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMode {
    #[default]
    RtmpIngest,
    BrowserWhip,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateStream {
    pub stream_id: String,
    #[serde(default)]
    pub provider_stream_id: Option<String>,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    /// Wallet address allowed to heartbeat and stop this stream
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateSession {
    pub wallet_address: String,
    /// Seconds, server default when absent
    #[serde(default)]
    pub ttl: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub session_token: String,
    pub wallet_address: String,
    pub stream_id: String,
    pub is_live: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StopStream {
    pub session_token: String,
    pub wallet_address: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Viewer {
    pub viewer_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SweepQuery {
    pub timeout_minutes: u64,
}
