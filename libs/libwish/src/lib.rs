use iceserver::IceServer;
use reqwest::{
    header::{self, HeaderMap, HeaderValue},
    Response, StatusCode,
};
use tracing::{debug, warn};
use url::Url;

pub const CONTENT_TYPE_SDP: &str = "application/sdp";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request never produced a response
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("endpoint answered {status}: {body}")]
    Negotiation { status: StatusCode, body: String },
    #[error("protocol: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One SDP offer/answer exchange against a WHIP or WHEP endpoint.
#[derive(Clone)]
pub struct Client {
    url: String,
    default_headers: HeaderMap,
    http: reqwest::Client,
    resource: Option<String>,
}

impl Client {
    pub fn get_auth_header_map(token: Option<String>) -> Option<HeaderMap> {
        let token = token?;
        let value = HeaderValue::from_str(&format!("Bearer {}", token)).ok()?;
        let mut header_map = HeaderMap::new();
        header_map.insert(header::AUTHORIZATION, value);
        Some(header_map)
    }

    pub fn new(url: String, default_headers: Option<HeaderMap>) -> Self {
        Self::with_http(reqwest::Client::new(), url, default_headers)
    }

    pub fn with_http(http: reqwest::Client, url: String, default_headers: Option<HeaderMap>) -> Self {
        Client {
            url,
            default_headers: default_headers.unwrap_or_default(),
            http,
            resource: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Session resource returned in `Location` by the last successful exchange.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// POSTs the offer and returns the answer SDP together with any ICE
    /// servers advertised in `Link` headers.
    pub async fn wish(&mut self, offer: String) -> Result<(String, Vec<IceServer>)> {
        let mut headers = self.default_headers.clone();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_SDP));
        let response = self
            .http
            .post(&self.url)
            .headers(headers)
            .body(offer)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(negotiation_error(response).await);
        }

        self.resource = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|location| resolve_location(&self.url, location));
        let ice_servers = parse_ice_servers(response.headers());

        let answer = response.text().await?;
        if !answer.trim_start().starts_with("v=") {
            return Err(Error::Protocol(format!(
                "answer is not a session description ({} bytes)",
                answer.len()
            )));
        }
        debug!(url = self.url, resource = ?self.resource, "answer received");
        Ok((answer, ice_servers))
    }

    /// ICE servers the endpoint advertises on OPTIONS.
    pub async fn ice_servers(&self) -> Result<Vec<IceServer>> {
        let response = self
            .http
            .request(reqwest::Method::OPTIONS, &self.url)
            .headers(self.default_headers.clone())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(negotiation_error(response).await);
        }
        Ok(parse_ice_servers(response.headers()))
    }

    /// DELETEs the session resource. A client that never negotiated is a no-op.
    pub async fn remove_resource(&mut self) -> Result<()> {
        let Some(resource) = self.resource.take() else {
            return Ok(());
        };
        let response = self
            .http
            .delete(&resource)
            .headers(self.default_headers.clone())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(negotiation_error(response).await);
        }
        Ok(())
    }
}

async fn negotiation_error(response: Response) -> Error {
    let status = response.status();
    let body = match status {
        StatusCode::UNAUTHORIZED => "identity authentication failed".to_owned(),
        _ => response.text().await.unwrap_or_default(),
    };
    Error::Negotiation { status, body }
}

fn resolve_location(base: &str, location: &str) -> Option<String> {
    Url::parse(base)
        .and_then(|base| base.join(location))
        .map(|u| u.to_string())
        .ok()
}

/// `Link: <turn://host:3478?transport=udp>; rel="ice-server"; username="u"; credential="p"`
///
/// The scheme separator is written `://` on the wire so the uri survives
/// link header parsing; it is folded back to `turn:` here.
pub fn parse_ice_servers(headers: &HeaderMap) -> Vec<IceServer> {
    let mut ice_servers = vec![];
    for link in headers.get_all(header::LINK) {
        let Ok(link) = link.to_str() else {
            continue;
        };
        let links = match parse_link_header::parse_with_rel(link) {
            Ok(links) => links,
            Err(e) => {
                warn!("ignore malformed Link header {:?}: {:?}", link, e);
                continue;
            }
        };
        for (rel, mut link) in links {
            if rel != "ice-server" {
                continue;
            }
            ice_servers.push(IceServer {
                urls: vec![link.raw_uri.replacen("://", ":", 1)],
                username: link.params.remove("username").unwrap_or_default(),
                credential: link.params.remove("credential").unwrap_or_default(),
            });
        }
    }
    ice_servers
}
