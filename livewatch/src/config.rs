use std::{env, fs, net::SocketAddr, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub liveness: Liveness,
    #[serde(default)]
    pub presence: Presence,
    #[serde(default)]
    pub webhook: Webhook,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Http {
    #[serde(default = "default_http_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub cors: bool,
}

/// Bearer tokens for the admin routes. Empty disables the check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Auth {
    #[serde(default)]
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Provider status API. Polling is disabled while `api_url` is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provider {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liveness {
    #[serde(default)]
    pub poll_tick_time: PollTickTime,
    /// Provider must have seen ingest within this many ms to count as active
    #[serde(default)]
    pub idle_window: IdleWindow,
    #[serde(default)]
    pub sweep_tick_time: SweepTickTime,
    #[serde(default)]
    pub heartbeat_timeout: HeartbeatTimeout,
    /// Heartbeat session lifetime, seconds
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PollTickTime(pub u64);

impl Default for PollTickTime {
    fn default() -> Self {
        PollTickTime(15 * 1000)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IdleWindow(pub u64);

impl Default for IdleWindow {
    fn default() -> Self {
        IdleWindow(30 * 1000)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SweepTickTime(pub u64);

impl Default for SweepTickTime {
    fn default() -> Self {
        SweepTickTime(60 * 1000)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeartbeatTimeout(pub u64);

impl Default for HeartbeatTimeout {
    fn default() -> Self {
        HeartbeatTimeout(60 * 1000)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            poll_tick_time: Default::default(),
            idle_window: Default::default(),
            sweep_tick_time: Default::default(),
            heartbeat_timeout: Default::default(),
            session_ttl: default_session_ttl(),
        }
    }
}

fn default_session_ttl() -> u64 {
    24 * 60 * 60
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Presence {
    /// Viewers silent for longer than this many ms stop being counted
    #[serde(default = "default_presence_timeout")]
    pub timeout: u64,
}

impl Default for Presence {
    fn default() -> Self {
        Self {
            timeout: default_presence_timeout(),
        }
    }
}

fn default_presence_timeout() -> u64 {
    90 * 1000
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Webhook {
    #[serde(default)]
    pub webhooks: Vec<String>,
}

fn default_http_listen() -> SocketAddr {
    SocketAddr::from_str(&format!(
        "0.0.0.0:{}",
        env::var("PORT").unwrap_or(String::from("8888"))
    ))
    .expect("invalid listen address")
}

impl Default for Http {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
            cors: Default::default(),
        }
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    })
}

impl Config {
    pub fn parse(path: Option<String>) -> Self {
        let result = fs::read_to_string(path.unwrap_or(String::from("livecast.toml")))
            .or(fs::read_to_string("/etc/livecast/livecast.toml"))
            .unwrap_or("".to_string());
        let cfg: Self = toml::from_str(result.as_str()).expect("config parse error");
        match cfg.validate() {
            Ok(_) => cfg,
            Err(err) => panic!("config validate [{}]", err),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.liveness.idle_window.0 == 0 {
            return Err(anyhow::anyhow!("liveness.idle_window must be positive"));
        }
        if self.liveness.heartbeat_timeout.0 < self.liveness.idle_window.0 {
            return Err(anyhow::anyhow!(
                "liveness.heartbeat_timeout must not be shorter than liveness.idle_window"
            ));
        }
        Ok(())
    }
}
