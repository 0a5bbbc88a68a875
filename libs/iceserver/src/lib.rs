pub mod coturn;

use serde::{Deserialize, Serialize};
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct IceServer {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

impl From<IceServer> for RTCIceServer {
    fn from(val: IceServer) -> Self {
        RTCIceServer {
            urls: val.urls,
            username: val.username,
            credential: val.credential,
            ..Default::default()
        }
    }
}

/// STUN and TURN co-located on the media host.
///
/// Without credentials only the STUN entry is returned: a TURN url with an
/// empty username is rejected by the ICE agent anyway.
pub fn host_servers(endpoint: &Url, credentials: Option<(String, String)>) -> Vec<IceServer> {
    let Some(host) = endpoint.host_str() else {
        return vec![];
    };
    let mut servers = vec![IceServer {
        urls: vec![format!("stun:{host}")],
        ..Default::default()
    }];
    if let Some((username, credential)) = credentials {
        servers.push(IceServer {
            urls: vec![format!("turn:{host}")],
            username,
            credential,
        });
    }
    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_servers_stun_only() {
        let url = Url::parse("https://media.example.com/whip/abc").unwrap();
        let servers = host_servers(&url, None);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["stun:media.example.com"]);
        assert!(!servers[0].is_turn());
    }

    #[test]
    fn test_host_servers_with_turn() {
        let url = Url::parse("https://media.example.com:8443/whep/abc").unwrap();
        let servers = host_servers(&url, Some(("u".to_string(), "p".to_string())));
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].urls, vec!["turn:media.example.com"]);
        assert_eq!(servers[1].username, "u");
        assert!(servers[1].is_turn());

        let rtc: RTCIceServer = servers[1].clone().into();
        assert_eq!(rtc.credential, "p");
    }
}
