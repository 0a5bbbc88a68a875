use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use api::request::DeliveryMode;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderView {
    pub active: bool,
    pub observed_at: DateTime<Utc>,
}

/// One broadcast lifecycle. `is_live`, `last_heartbeat` and `ended_at` are
/// only written by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    pub stream_id: String,
    pub provider_stream_id: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub owner: Option<String>,
    pub is_live: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub recording_playback_id: Option<String>,
    /// Time of the last explicit stop (idle webhook or client stop)
    pub(crate) stopped_at: Option<DateTime<Utc>>,
    /// Latest provider opinion from a webhook or poll
    pub(crate) provider: Option<ProviderView>,
}

impl StreamSession {
    pub fn new(
        stream_id: String,
        provider_stream_id: Option<String>,
        delivery_mode: DeliveryMode,
        owner: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            stream_id,
            provider_stream_id,
            delivery_mode,
            owner,
            is_live: false,
            last_heartbeat: now,
            ended_at: None,
            recording_playback_id: None,
            stopped_at: None,
            provider: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct MemStore {
    streams: Arc<RwLock<HashMap<String, StreamSession>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns false when the id is already taken.
    pub fn insert(&self, session: StreamSession) -> bool {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        if streams.contains_key(&session.stream_id) {
            return false;
        }
        streams.insert(session.stream_id.clone(), session);
        true
    }

    pub fn get(&self, stream_id: &str) -> Option<StreamSession> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_id)
            .cloned()
    }

    pub fn find_by_provider(&self, provider_stream_id: &str) -> Option<String> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|s| s.provider_stream_id.as_deref() == Some(provider_stream_id))
            .map(|s| s.stream_id.clone())
    }

    pub fn list(&self) -> Vec<StreamSession> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Runs `f` under the write lock so concurrent signals for the same
    /// stream apply one after another.
    pub fn update<R>(&self, stream_id: &str, f: impl FnOnce(&mut StreamSession) -> R) -> Option<R> {
        self.streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(stream_id)
            .map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let store = MemStore::new();
        let now = Utc::now();
        let session = StreamSession::new(
            "s1".to_string(),
            Some("p1".to_string()),
            DeliveryMode::BrowserWhip,
            None,
            now,
        );
        assert!(store.insert(session.clone()));
        assert!(!store.insert(session));
        assert_eq!(store.find_by_provider("p1").as_deref(), Some("s1"));
        assert!(store.find_by_provider("p2").is_none());

        let live = store.update("s1", |s| {
            s.is_live = true;
            s.is_live
        });
        assert_eq!(live, Some(true));
        assert!(store.get("s1").unwrap().is_live);
        assert!(store.update("missing", |_| ()).is_none());
        assert_eq!(store.list().len(), 1);
    }
}
