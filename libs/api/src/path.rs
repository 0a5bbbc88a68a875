pub const PROVIDER_WEBHOOK: &str = "/webhooks/provider";
pub const HEARTBEAT: &str = "/api/heartbeat";
pub const SESSIONS: &str = "/api/sessions";
pub const SWEEP: &str = "/api/sweep";
pub const STREAMS: &str = "/api/streams";

pub fn stream(stream: &str) -> String {
    format!("/api/streams/{}", stream)
}

pub fn stream_stop(stream: &str) -> String {
    format!("/api/streams/{}/stop", stream)
}

pub fn viewers_join(stream: &str) -> String {
    format!("/api/streams/{}/viewers/join", stream)
}

pub fn viewers_leave(stream: &str) -> String {
    format!("/api/streams/{}/viewers/leave", stream)
}

pub fn viewers_heartbeat(stream: &str) -> String {
    format!("/api/streams/{}/viewers/heartbeat", stream)
}

pub fn sweep(timeout_minutes: u64) -> String {
    format!("{}?timeout_minutes={}", SWEEP, timeout_minutes)
}
