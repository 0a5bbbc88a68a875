use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Aggregated viewer counts. Each viewer owns its own row through
/// join/leave/heartbeat; the server only counts rows that are not stale.
#[derive(Clone)]
pub struct ViewerRegistry {
    viewers: Arc<RwLock<HashMap<String, HashMap<String, DateTime<Utc>>>>>,
    timeout: TimeDelta,
}

impl ViewerRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            viewers: Default::default(),
            timeout: TimeDelta::from_std(timeout).unwrap_or(TimeDelta::seconds(90)),
        }
    }

    pub fn join(&self, stream_id: &str, viewer_id: &str) -> u64 {
        self.join_at(stream_id, viewer_id, Utc::now())
    }

    pub fn leave(&self, stream_id: &str, viewer_id: &str) -> u64 {
        let now = Utc::now();
        let mut viewers = self.viewers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(stream) = viewers.get_mut(stream_id) {
            stream.remove(viewer_id);
            if stream.is_empty() {
                viewers.remove(stream_id);
            }
        }
        Self::count_locked(&viewers, stream_id, now, self.timeout)
    }

    /// Refreshes a joined viewer. Unknown viewers are not implicitly joined.
    pub fn heartbeat(&self, stream_id: &str, viewer_id: &str) -> u64 {
        self.heartbeat_at(stream_id, viewer_id, Utc::now())
    }

    pub fn count(&self, stream_id: &str) -> u64 {
        self.count_at(stream_id, Utc::now())
    }

    pub(crate) fn join_at(&self, stream_id: &str, viewer_id: &str, now: DateTime<Utc>) -> u64 {
        let mut viewers = self.viewers.write().unwrap_or_else(PoisonError::into_inner);
        viewers
            .entry(stream_id.to_string())
            .or_default()
            .insert(viewer_id.to_string(), now);
        Self::count_locked(&viewers, stream_id, now, self.timeout)
    }

    pub(crate) fn heartbeat_at(&self, stream_id: &str, viewer_id: &str, now: DateTime<Utc>) -> u64 {
        let mut viewers = self.viewers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(seen) = viewers
            .get_mut(stream_id)
            .and_then(|stream| stream.get_mut(viewer_id))
        {
            *seen = now;
        }
        Self::count_locked(&viewers, stream_id, now, self.timeout)
    }

    pub(crate) fn count_at(&self, stream_id: &str, now: DateTime<Utc>) -> u64 {
        let viewers = self.viewers.read().unwrap_or_else(PoisonError::into_inner);
        Self::count_locked(&viewers, stream_id, now, self.timeout)
    }

    /// Drops stale rows everywhere.
    pub fn prune(&self) {
        let now = Utc::now();
        let mut viewers = self.viewers.write().unwrap_or_else(PoisonError::into_inner);
        for stream in viewers.values_mut() {
            stream.retain(|_, seen| now - *seen <= self.timeout);
        }
        viewers.retain(|_, stream| !stream.is_empty());
    }

    fn count_locked(
        viewers: &HashMap<String, HashMap<String, DateTime<Utc>>>,
        stream_id: &str,
        now: DateTime<Utc>,
        timeout: TimeDelta,
    ) -> u64 {
        viewers
            .get(stream_id)
            .map(|stream| stream.values().filter(|seen| now - **seen <= timeout).count() as u64)
            .unwrap_or(0)
    }
}
