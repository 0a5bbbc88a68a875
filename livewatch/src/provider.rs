use api::event::ProviderStream;
use async_trait::async_trait;
use reqwest::header;

/// Read access to the media provider's own view of a stream.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn stream_status(&self, provider_stream_id: &str) -> anyhow::Result<ProviderStream>;
}

pub struct HttpProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl HttpProvider {
    pub fn new(client: reqwest::Client, api_url: String, api_key: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl ProviderApi for HttpProvider {
    async fn stream_status(&self, provider_stream_id: &str) -> anyhow::Result<ProviderStream> {
        let mut request = self
            .client
            .get(format!("{}/stream/{}", self.api_url, provider_stream_id));
        if !self.api_key.is_empty() {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", self.api_key));
        }
        let stream = request
            .send()
            .await?
            .error_for_status()?
            .json::<ProviderStream>()
            .await?;
        Ok(stream)
    }
}
