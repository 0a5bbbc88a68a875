//! Single writer of `StreamSession::is_live`.
//!
//! Signals race each other (webhooks are pushed while a poll tick is running),
//! so ordering is resolved by priority instead of by locking:
//!
//! 1. An explicit stop (idle webhook, client stop) ends the stream at once and
//!    leaves a fence: for `idle_window` afterwards, nothing but a
//!    `stream.started` webhook may bring the stream back.
//! 2. The provider poll corrects local state in either direction.
//! 3. Heartbeats only refresh recency. A heartbeat starts a stream only when
//!    the provider recently reported it active.
use std::time::Duration;

use api::event::{
    LivenessEvent, ProviderStream, ProviderWebhook, SignalSource, EVENT_RECORDING_READY,
    EVENT_STREAM_IDLE, EVENT_STREAM_STARTED,
};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::provider::ProviderApi;
use crate::result::Result;
use crate::store::{MemStore, ProviderView, StreamSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Live,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessSignal {
    pub source: SignalSource,
    pub value: Liveness,
    pub observed_at: DateTime<Utc>,
}

impl LivenessSignal {
    pub fn new(source: SignalSource, value: Liveness, observed_at: DateTime<Utc>) -> Self {
        Self {
            source,
            value,
            observed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started,
    Ended,
    Refreshed,
    Unchanged,
}

impl Transition {
    pub fn is_edge(&self) -> bool {
        matches!(self, Transition::Started | Transition::Ended)
    }
}

pub fn reconcile(
    session: &mut StreamSession,
    signal: LivenessSignal,
    now: DateTime<Utc>,
    idle_window: TimeDelta,
) -> Transition {
    let fenced = |s: &StreamSession, at: DateTime<Utc>| {
        s.stopped_at.is_some_and(|stopped| at <= stopped + idle_window)
    };

    match (signal.source, signal.value) {
        (SignalSource::ClientStop, _)
        | (SignalSource::Webhook, Liveness::Idle)
        | (SignalSource::Heartbeat, Liveness::Idle) => {
            if signal.source == SignalSource::Webhook {
                session.provider = Some(ProviderView {
                    active: false,
                    observed_at: signal.observed_at,
                });
            }
            session.stopped_at = Some(match session.stopped_at {
                Some(prev) => prev.max(signal.observed_at),
                None => signal.observed_at,
            });
            end(session, now)
        }
        (SignalSource::Webhook, Liveness::Live) => {
            session.provider = Some(ProviderView {
                active: true,
                observed_at: signal.observed_at,
            });
            session.stopped_at = None;
            start_or_refresh(session, signal.observed_at, now)
        }
        (SignalSource::Poll, Liveness::Live) => {
            session.provider = Some(ProviderView {
                active: true,
                observed_at: signal.observed_at,
            });
            if fenced(session, signal.observed_at) {
                return Transition::Unchanged;
            }
            start_or_refresh(session, signal.observed_at, now)
        }
        (SignalSource::Poll, Liveness::Idle) => {
            session.provider = Some(ProviderView {
                active: false,
                observed_at: signal.observed_at,
            });
            end(session, now)
        }
        (SignalSource::Heartbeat, Liveness::Live) => {
            if session.is_live {
                return refresh(session, signal.observed_at);
            }
            let corroborated = session.provider.is_some_and(|p| {
                p.active && signal.observed_at - p.observed_at <= idle_window
            });
            if corroborated && !fenced(session, signal.observed_at) {
                start_or_refresh(session, signal.observed_at, now)
            } else {
                Transition::Unchanged
            }
        }
        (SignalSource::Sweep, _) => end(session, now),
    }
}

fn start_or_refresh(session: &mut StreamSession, at: DateTime<Utc>, now: DateTime<Utc>) -> Transition {
    if session.is_live {
        return refresh(session, at);
    }
    session.is_live = true;
    session.ended_at = None;
    session.last_heartbeat = now;
    Transition::Started
}

fn refresh(session: &mut StreamSession, at: DateTime<Utc>) -> Transition {
    if at > session.last_heartbeat {
        session.last_heartbeat = at;
    }
    Transition::Refreshed
}

fn end(session: &mut StreamSession, now: DateTime<Utc>) -> Transition {
    if !session.is_live {
        return Transition::Unchanged;
    }
    session.is_live = false;
    session.last_heartbeat = now;
    session.ended_at.get_or_insert(now);
    Transition::Ended
}

#[derive(Clone)]
pub struct Reconciler {
    store: MemStore,
    idle_window: TimeDelta,
    events: broadcast::Sender<LivenessEvent>,
}

impl Reconciler {
    pub fn new(store: MemStore, idle_window: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            idle_window: TimeDelta::from_std(idle_window).unwrap_or(TimeDelta::seconds(30)),
            events,
        }
    }

    pub fn store(&self) -> &MemStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.events.subscribe()
    }

    /// `None` when the stream is unknown.
    pub fn apply(&self, stream_id: &str, signal: LivenessSignal) -> Option<Transition> {
        self.apply_at(stream_id, signal, Utc::now())
    }

    pub(crate) fn apply_at(
        &self,
        stream_id: &str,
        signal: LivenessSignal,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        let (transition, event) = self.store.update(stream_id, |session| {
            let transition = reconcile(session, signal, now, self.idle_window);
            let event = transition.is_edge().then(|| LivenessEvent {
                stream_id: session.stream_id.clone(),
                is_live: session.is_live,
                source: signal.source,
                last_heartbeat: session.last_heartbeat.timestamp_millis(),
                ended_at: session.ended_at.map(|t| t.timestamp_millis()),
            });
            (transition, event)
        })?;

        match event {
            Some(event) => {
                info!(
                    stream = event.stream_id,
                    source = ?event.source,
                    is_live = event.is_live,
                    ended_at = ?event.ended_at,
                    "liveness transition"
                );
                let _ = self.events.send(event);
            }
            None => debug!(stream = stream_id, source = ?signal.source, ?transition, "liveness signal"),
        }
        Some(transition)
    }

    pub fn webhook(&self, hook: ProviderWebhook) -> Result<Transition> {
        self.webhook_at(hook, Utc::now())
    }

    pub(crate) fn webhook_at(&self, hook: ProviderWebhook, now: DateTime<Utc>) -> Result<Transition> {
        let provider_stream = hook
            .stream
            .ok_or_else(|| AppError::bad_request("webhook without stream"))?;
        let stream_id = self
            .store
            .find_by_provider(&provider_stream.id)
            .ok_or_else(|| AppError::stream_not_found(&provider_stream.id))?;

        let value = match hook.event.as_str() {
            EVENT_STREAM_STARTED => Liveness::Live,
            EVENT_STREAM_IDLE => Liveness::Idle,
            EVENT_RECORDING_READY => {
                let recording = provider_stream
                    .recording_playback_id
                    .or(provider_stream.playback_id);
                self.store.update(&stream_id, |s| {
                    s.recording_playback_id = recording;
                });
                return Ok(Transition::Unchanged);
            }
            other => {
                debug!(stream = stream_id, event = other, "ignore webhook event");
                return Ok(Transition::Unchanged);
            }
        };
        let signal = LivenessSignal::new(SignalSource::Webhook, value, now);
        self.apply_at(&stream_id, signal, now)
            .ok_or_else(|| AppError::stream_not_found(&stream_id))
    }

    pub fn client_stop(&self, stream_id: &str) -> Result<Transition> {
        let now = Utc::now();
        let signal = LivenessSignal::new(SignalSource::ClientStop, Liveness::Idle, now);
        self.apply_at(stream_id, signal, now)
            .ok_or_else(|| AppError::stream_not_found(stream_id))
    }

    pub fn heartbeat(&self, stream_id: &str, is_live: bool) -> Result<Transition> {
        let now = Utc::now();
        let value = if is_live { Liveness::Live } else { Liveness::Idle };
        let signal = LivenessSignal::new(SignalSource::Heartbeat, value, now);
        self.apply_at(stream_id, signal, now)
            .ok_or_else(|| AppError::stream_not_found(stream_id))
    }

    /// Feeds one provider status answer in as a poll signal.
    pub fn observe_provider(&self, stream_id: &str, status: &ProviderStream) -> Option<Transition> {
        self.observe_provider_at(stream_id, status, Utc::now())
    }

    pub(crate) fn observe_provider_at(
        &self,
        stream_id: &str,
        status: &ProviderStream,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        let last_seen = status.last_seen.and_then(DateTime::from_timestamp_millis);
        let signal = match last_seen {
            Some(seen) if status.is_active && now - seen <= self.idle_window => {
                LivenessSignal::new(SignalSource::Poll, Liveness::Live, seen.min(now))
            }
            _ => LivenessSignal::new(SignalSource::Poll, Liveness::Idle, now),
        };
        self.apply_at(stream_id, signal, now)
    }

    /// One correction pass over every stream that has a provider id.
    /// Returns how many streams flipped.
    pub async fn poll(&self, provider: &dyn ProviderApi) -> usize {
        let mut corrected = 0;
        for session in self.store.list() {
            let Some(provider_stream_id) = session.provider_stream_id.as_deref() else {
                continue;
            };
            match provider.stream_status(provider_stream_id).await {
                Ok(status) => {
                    if self
                        .observe_provider(&session.stream_id, &status)
                        .is_some_and(|t| t.is_edge())
                    {
                        corrected += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        stream = session.stream_id,
                        provider_stream_id, "provider status unavailable, skip: {:?}", e
                    );
                }
            }
        }
        corrected
    }

    /// Force-ends live streams whose last heartbeat is older than `timeout`.
    pub fn sweep(&self, timeout: Duration) -> usize {
        self.sweep_at(timeout, Utc::now())
    }

    pub(crate) fn sweep_at(&self, timeout: Duration, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = TimeDelta::from_std(timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
        else {
            return 0;
        };
        self.store
            .list()
            .into_iter()
            .filter(|s| s.is_live && s.last_heartbeat < cutoff)
            .filter(|s| {
                let signal = LivenessSignal::new(SignalSource::Sweep, Liveness::Idle, now);
                self.apply_at(&s.stream_id, signal, now) == Some(Transition::Ended)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use api::request::DeliveryMode;

    use super::*;
    use crate::provider::MockProviderApi;

    const WINDOW: Duration = Duration::from_secs(30);

    fn reconciler_with(streams: &[(&str, &str)]) -> Reconciler {
        let store = MemStore::new();
        for (id, provider) in streams {
            store.insert(StreamSession::new(
                id.to_string(),
                Some(provider.to_string()),
                DeliveryMode::BrowserWhip,
                None,
                Utc::now(),
            ));
        }
        Reconciler::new(store, WINDOW)
    }

    fn hook(event: &str, provider: &str) -> ProviderWebhook {
        ProviderWebhook {
            event: event.to_string(),
            stream: Some(ProviderStream {
                id: provider.to_string(),
                ..Default::default()
            }),
        }
    }

    fn active(provider: &str, seen: DateTime<Utc>) -> ProviderStream {
        ProviderStream {
            id: provider.to_string(),
            is_active: true,
            last_seen: Some(seen.timestamp_millis()),
            ..Default::default()
        }
    }

    fn count_edges(rx: &mut broadcast::Receiver<LivenessEvent>) -> (usize, usize) {
        let (mut up, mut down) = (0, 0);
        while let Ok(event) = rx.try_recv() {
            if event.is_live {
                up += 1;
            } else {
                down += 1;
            }
        }
        (up, down)
    }

    #[derive(Clone, Copy, Debug)]
    enum Step {
        IdleWebhook,
        ActivePoll,
        Heartbeat,
    }

    #[test]
    fn test_idle_webhook_wins_any_interleaving() {
        let orders = [
            [Step::IdleWebhook, Step::ActivePoll, Step::Heartbeat],
            [Step::IdleWebhook, Step::Heartbeat, Step::ActivePoll],
            [Step::ActivePoll, Step::IdleWebhook, Step::Heartbeat],
            [Step::ActivePoll, Step::Heartbeat, Step::IdleWebhook],
            [Step::Heartbeat, Step::IdleWebhook, Step::ActivePoll],
            [Step::Heartbeat, Step::ActivePoll, Step::IdleWebhook],
        ];
        for order in orders {
            let r = reconciler_with(&[("s", "p")]);
            let t0 = Utc::now();
            r.webhook_at(hook(EVENT_STREAM_STARTED, "p"), t0).unwrap();
            let mut rx = r.subscribe();

            let mut ended_at = None;
            for (i, step) in order.iter().enumerate() {
                let now = t0 + TimeDelta::seconds(1 + i as i64);
                match step {
                    Step::IdleWebhook => {
                        r.webhook_at(hook(EVENT_STREAM_IDLE, "p"), now).unwrap();
                    }
                    Step::ActivePoll => {
                        r.observe_provider_at("s", &active("p", now), now);
                    }
                    Step::Heartbeat => {
                        let signal =
                            LivenessSignal::new(SignalSource::Heartbeat, Liveness::Live, now);
                        r.apply_at("s", signal, now);
                    }
                }
                let s = r.store().get("s").unwrap();
                if let Some(at) = ended_at {
                    assert_eq!(s.ended_at, Some(at), "{:?}", order);
                }
                ended_at = s.ended_at;
            }

            let s = r.store().get("s").unwrap();
            assert!(!s.is_live, "{:?}", order);
            assert!(s.ended_at.is_some(), "{:?}", order);
            assert_eq!(count_edges(&mut rx), (0, 1), "{:?}", order);
        }
    }

    #[test]
    fn test_started_then_client_stop_then_idle_webhook() {
        let r = reconciler_with(&[("s", "p")]);
        let mut rx = r.subscribe();

        r.webhook(hook(EVENT_STREAM_STARTED, "p")).unwrap();
        let s = r.store().get("s").unwrap();
        assert!(s.is_live);
        assert!(s.ended_at.is_none());

        assert_eq!(r.client_stop("s").unwrap(), Transition::Ended);
        let s = r.store().get("s").unwrap();
        assert!(!s.is_live);
        let ended_at = s.ended_at.unwrap();
        assert!(ended_at <= Utc::now());

        assert_eq!(
            r.webhook(hook(EVENT_STREAM_IDLE, "p")).unwrap(),
            Transition::Unchanged
        );
        assert_eq!(r.store().get("s").unwrap().ended_at, Some(ended_at));
        assert_eq!(count_edges(&mut rx), (1, 1));
    }

    #[test]
    fn test_unknown_provider_stream() {
        let r = reconciler_with(&[("s", "p")]);
        assert!(matches!(
            r.webhook(hook(EVENT_STREAM_STARTED, "nope")),
            Err(AppError::StreamNotFound(_))
        ));
        let no_stream = ProviderWebhook {
            event: EVENT_STREAM_STARTED.to_string(),
            stream: None,
        };
        assert!(matches!(r.webhook(no_stream), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn test_recording_ready_keeps_liveness() {
        let r = reconciler_with(&[("s", "p")]);
        let mut ready = hook(EVENT_RECORDING_READY, "p");
        if let Some(stream) = ready.stream.as_mut() {
            stream.recording_playback_id = Some("rec-1".to_string());
        }
        assert_eq!(r.webhook(ready).unwrap(), Transition::Unchanged);
        let s = r.store().get("s").unwrap();
        assert!(!s.is_live);
        assert_eq!(s.recording_playback_id.as_deref(), Some("rec-1"));
    }

    #[test]
    fn test_poll_corrects_both_directions() {
        let r = reconciler_with(&[("s", "p")]);
        let now = Utc::now();

        // webhook missed, provider reports recent activity
        assert_eq!(
            r.observe_provider_at("s", &active("p", now - TimeDelta::seconds(5)), now),
            Some(Transition::Started)
        );
        assert!(r.store().get("s").unwrap().is_live);

        // flagged active but silent longer than the idle window
        let later = now + TimeDelta::seconds(60);
        assert_eq!(
            r.observe_provider_at("s", &active("p", now), later),
            Some(Transition::Ended)
        );
        assert!(!r.store().get("s").unwrap().is_live);
    }

    #[test]
    fn test_poll_resurrects_after_fence() {
        let r = reconciler_with(&[("s", "p")]);
        let t0 = Utc::now();
        r.webhook_at(hook(EVENT_STREAM_STARTED, "p"), t0).unwrap();
        r.webhook_at(hook(EVENT_STREAM_IDLE, "p"), t0).unwrap();

        let inside = t0 + TimeDelta::seconds(10);
        assert_eq!(
            r.observe_provider_at("s", &active("p", inside), inside),
            Some(Transition::Unchanged)
        );
        let after = t0 + TimeDelta::seconds(45);
        assert_eq!(
            r.observe_provider_at("s", &active("p", after), after),
            Some(Transition::Started)
        );
        let s = r.store().get("s").unwrap();
        assert!(s.is_live);
        assert!(s.ended_at.is_none());
    }

    #[test]
    fn test_heartbeat_cannot_resurrect_alone() {
        let r = reconciler_with(&[("s", "p")]);
        assert_eq!(r.heartbeat("s", true).unwrap(), Transition::Unchanged);
        assert!(!r.store().get("s").unwrap().is_live);

        // provider says idle
        let now = Utc::now();
        r.observe_provider_at(
            "s",
            &ProviderStream {
                id: "p".to_string(),
                ..Default::default()
            },
            now,
        );
        assert_eq!(r.heartbeat("s", true).unwrap(), Transition::Unchanged);
        assert!(!r.store().get("s").unwrap().is_live);
    }

    #[test]
    fn test_heartbeat_corroborated_by_provider() {
        let r = reconciler_with(&[("s", "p")]);
        let t0 = Utc::now();
        r.store().update("s", |s| {
            s.provider = Some(ProviderView {
                active: true,
                observed_at: t0,
            })
        });
        let signal = LivenessSignal::new(
            SignalSource::Heartbeat,
            Liveness::Live,
            t0 + TimeDelta::seconds(5),
        );
        assert_eq!(
            r.apply_at("s", signal, t0 + TimeDelta::seconds(5)),
            Some(Transition::Started)
        );
    }

    #[test]
    fn test_heartbeat_refreshes_live_stream() {
        let r = reconciler_with(&[("s", "p")]);
        let t0 = Utc::now();
        r.webhook_at(hook(EVENT_STREAM_STARTED, "p"), t0).unwrap();
        let later = t0 + TimeDelta::seconds(15);
        let signal = LivenessSignal::new(SignalSource::Heartbeat, Liveness::Live, later);
        assert_eq!(r.apply_at("s", signal, later), Some(Transition::Refreshed));
        assert_eq!(r.store().get("s").unwrap().last_heartbeat, later);
    }

    #[test]
    fn test_heartbeat_not_live_is_stop() {
        let r = reconciler_with(&[("s", "p")]);
        r.webhook(hook(EVENT_STREAM_STARTED, "p")).unwrap();
        assert_eq!(r.heartbeat("s", false).unwrap(), Transition::Ended);
        assert!(matches!(
            r.heartbeat("missing", true),
            Err(AppError::StreamNotFound(_))
        ));
    }

    #[test]
    fn test_ended_at_written_once() {
        let r = reconciler_with(&[("s", "p")]);
        let t0 = Utc::now();
        r.webhook_at(hook(EVENT_STREAM_STARTED, "p"), t0).unwrap();
        r.webhook_at(hook(EVENT_STREAM_IDLE, "p"), t0 + TimeDelta::seconds(1))
            .unwrap();
        let first = r.store().get("s").unwrap().ended_at;
        for i in 2..5 {
            let now = t0 + TimeDelta::seconds(i);
            r.webhook_at(hook(EVENT_STREAM_IDLE, "p"), now).unwrap();
            r.client_stop("s").unwrap();
            r.observe_provider_at("s", &ProviderStream::default(), now);
        }
        assert_eq!(r.store().get("s").unwrap().ended_at, first);
    }

    #[test]
    fn test_sweep_ends_stale_streams() {
        let r = reconciler_with(&[("stale", "p1"), ("fresh", "p2"), ("idle", "p3")]);
        let t0 = Utc::now();
        r.webhook_at(hook(EVENT_STREAM_STARTED, "p1"), t0).unwrap();
        r.webhook_at(hook(EVENT_STREAM_STARTED, "p2"), t0).unwrap();

        let now = t0 + TimeDelta::seconds(90);
        let signal = LivenessSignal::new(SignalSource::Heartbeat, Liveness::Live, now);
        r.apply_at("fresh", signal, now);

        assert_eq!(r.sweep_at(Duration::from_secs(60), now), 1);
        assert!(!r.store().get("stale").unwrap().is_live);
        assert!(r.store().get("stale").unwrap().ended_at.is_some());
        assert!(r.store().get("fresh").unwrap().is_live);
        assert!(!r.store().get("idle").unwrap().is_live);

        assert_eq!(r.sweep_at(Duration::from_secs(60), now), 0);
    }

    #[test]
    fn test_sweep_with_huge_timeout_ends_nothing() {
        let r = reconciler_with(&[("s", "p")]);
        r.webhook(hook(EVENT_STREAM_STARTED, "p")).unwrap();
        assert_eq!(r.sweep(Duration::from_secs(60_000_000_000_000)), 0);
        assert_eq!(r.sweep(Duration::MAX), 0);
        assert!(r.store().get("s").unwrap().is_live);
    }

    #[tokio::test]
    async fn test_poll_skips_unreachable_provider() {
        let r = reconciler_with(&[("a", "pa"), ("b", "pb")]);
        r.webhook(hook(EVENT_STREAM_STARTED, "pa")).unwrap();

        let mut provider = MockProviderApi::new();
        provider
            .expect_stream_status()
            .withf(|id| id.to_string() == "pa")
            .returning(|_| Err(anyhow::anyhow!("connection refused")));
        provider
            .expect_stream_status()
            .withf(|id| id.to_string() == "pb")
            .returning(|id| Ok(active(id, Utc::now())));

        assert_eq!(r.poll(&provider).await, 1);
        assert!(r.store().get("a").unwrap().is_live);
        assert!(r.store().get("b").unwrap().is_live);
    }
}
