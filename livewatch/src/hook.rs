use std::time::Duration;

use api::event::LivenessEvent;
use reqwest::{header, Client};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// POSTs every liveness edge to one configured URL.
#[derive(Clone, Debug)]
pub struct WebHook {
    url: String,
    client: Client,
}

impl WebHook {
    pub fn new(url: String, client: Client) -> Self {
        WebHook { url, client }
    }

    async fn event_handler(&self, event: &LivenessEvent) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .timeout(Duration::from_secs(5))
            .json(event)
            .send()
            .await?;
        let success = response.status().is_success();
        let res_body = response.text().await.unwrap_or_default();
        debug!(url = self.url, ?event, success, res_body, "event webhook");
        if !success {
            return Err(anyhow::anyhow!("webhook answered: {res_body}"));
        }
        Ok(())
    }

    pub async fn hook(self, mut event_receiver: broadcast::Receiver<LivenessEvent>) {
        loop {
            match event_receiver.recv().await {
                Ok(event) => {
                    if let Err(e) = self.event_handler(&event).await {
                        warn!(url = self.url, stream = event.stream_id, "event webhook error: {:?}", e);
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(url = self.url, "event webhook lagged {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use api::event::SignalSource;
    use axum::{extract::State, routing::post, Json, Router};

    use super::*;

    fn event(stream_id: &str, is_live: bool) -> LivenessEvent {
        LivenessEvent {
            stream_id: stream_id.to_string(),
            is_live,
            source: SignalSource::Webhook,
            last_heartbeat: 1_700_000_000_000,
            ended_at: (!is_live).then_some(1_700_000_000_000),
        }
    }

    #[tokio::test]
    async fn test_hook_posts_every_edge() {
        let seen: Arc<Mutex<Vec<LivenessEvent>>> = Default::default();
        let app = Router::new()
            .route(
                "/hook",
                post(
                    |State(seen): State<Arc<Mutex<Vec<LivenessEvent>>>>,
                     Json(event): Json<LivenessEvent>| async move {
                        seen.lock().unwrap().push(event);
                    },
                ),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let (tx, rx) = broadcast::channel(8);
        let task = tokio::spawn(WebHook::new(format!("http://{addr}/hook"), Client::new()).hook(rx));
        tx.send(event("s1", true)).unwrap();
        tx.send(event("s1", false)).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![event("s1", true), event("s1", false)]);
    }

    #[tokio::test]
    async fn test_unreachable_hook_keeps_running() {
        let (tx, rx) = broadcast::channel(8);
        let task = tokio::spawn(
            WebHook::new("http://127.0.0.1:9/hook".to_string(), Client::new()).hook(rx),
        );
        tx.send(event("s1", true)).unwrap();
        tx.send(event("s1", false)).unwrap();
        drop(tx);
        task.await.unwrap();
    }
}
