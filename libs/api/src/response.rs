use serde::{Deserialize, Serialize};

use crate::request::DeliveryMode;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub stream_id: String,
    pub provider_stream_id: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub is_live: bool,
    pub last_heartbeat: i64,
    pub ended_at: Option<i64>,
    pub viewers: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_playback_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub wallet_address: String,
    pub expires_at: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ViewerCount {
    pub viewers: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Sweep {
    pub ended: u64,
}
