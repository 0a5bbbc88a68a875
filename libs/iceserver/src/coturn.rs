use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Short-lived TURN credentials, coturn REST API scheme
/// (`use-auth-secret` / `static-auth-secret`):
/// username -> "expiry:user",
/// password -> base64(hmac-sha1(key = shared secret, msg = username)).
pub fn generate_credentials(
    secret: &str,
    expiry_timestamp: u64,
    user: Option<&str>,
) -> (String, String) {
    let username = match user {
        Some(id) => format!("{expiry_timestamp}:{id}"),
        None => format!("{expiry_timestamp}"),
    };
    let password = sign(secret, &username);
    (username, password)
}

pub fn expiry_timestamp(ttl: Duration) -> u64 {
    (SystemTime::now() + ttl)
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn sign(secret: &str, username: &str) -> String {
    // new_from_slice only fails for fixed-size keys; HMAC takes any length
    let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(username.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}
