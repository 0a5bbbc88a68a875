use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

use crate::capture::CaptureAuthority;
use crate::error::SessionError;
use crate::machine::{Action, AttachPath, Input, Machine, MediaEvent, Notice, State};
use crate::sink::OutputSink;
use crate::transport::{Attachment, Connector, MediaTransport, Resolution};

pub type ReadyCallback = Box<dyn FnMut() + Send>;

enum Command {
    Start(crate::machine::Source),
    Stop(oneshot::Sender<()>),
    PreserveCapture(oneshot::Sender<Option<CaptureAuthority>>),
    AdoptCapture(CaptureAuthority),
}

enum Completion {
    Resolved {
        attempt: u64,
        result: Result<Resolution, SessionError>,
    },
    Attached {
        attempt: u64,
        result: Result<Attachment, SessionError>,
    },
}

/// Handle to one playback or broadcast session. Transitions run strictly in
/// order on a dedicated task; dropping the handle stops the session.
pub struct MediaSession {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<State>,
    notices: broadcast::Sender<Notice>,
}

impl MediaSession {
    pub fn spawn(connector: Arc<dyn Connector>, sink: OutputSink, on_ready: ReadyCallback) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(State::Idle);
        let (notices, _) = broadcast::channel(16);
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let driver = Driver {
            machine: Machine::new(),
            connector,
            sink,
            on_ready,
            notices: notices.clone(),
            state: state_tx,
            completions_tx,
            completions,
            transport: None,
            media: None,
            retry: None,
            resolving: None,
            capture: None,
        };
        tokio::spawn(driver.run(commands_rx));
        Self {
            commands,
            state,
            notices,
        }
    }

    /// Starts, or replaces the current source after a full teardown.
    pub fn start(&self, source: crate::machine::Source) {
        let _ = self.commands.send(Command::Start(source));
    }

    /// Closes the session and waits until its transport and timer are gone.
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> State {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<State> {
        self.state.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Resolves with the first closed or failed state.
    pub async fn wait_terminal(&self) -> State {
        let mut state = self.state.clone();
        let terminal = match state.wait_for(State::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => State::Closed,
        };
        terminal
    }

    /// Hands the capture's release authority to this session; stopping the
    /// session then releases it.
    pub fn adopt_capture(&self, authority: CaptureAuthority) {
        let _ = self.commands.send(Command::AdoptCapture(authority));
    }

    /// Takes the release authority back so the capture outlives the session.
    pub async fn preserve_capture(&self) -> Option<CaptureAuthority> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::PreserveCapture(tx)).ok()?;
        rx.await.ok().flatten()
    }
}

struct Driver {
    machine: Machine,
    connector: Arc<dyn Connector>,
    sink: OutputSink,
    on_ready: ReadyCallback,
    notices: broadcast::Sender<Notice>,
    state: watch::Sender<State>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    transport: Option<Box<dyn MediaTransport>>,
    media: Option<mpsc::UnboundedReceiver<MediaEvent>>,
    /// The only retry timer
    retry: Option<Pin<Box<Sleep>>>,
    resolving: Option<AbortHandle>,
    capture: Option<CaptureAuthority>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Start(source)) => self.apply(Input::Start(source)).await,
                    Some(Command::Stop(ack)) => {
                        self.apply(Input::Stop).await;
                        let _ = ack.send(());
                    }
                    Some(Command::PreserveCapture(reply)) => {
                        let _ = reply.send(self.capture.take());
                    }
                    Some(Command::AdoptCapture(authority)) => {
                        if let Some(previous) = self.capture.replace(authority) {
                            previous.release();
                        }
                    }
                    None => {
                        self.apply(Input::Stop).await;
                        break;
                    }
                },
                Some(done) = self.completions.recv() => self.complete(done).await,
                event = next_media(&mut self.media) => match event {
                    Some(event) => self.apply(Input::Media(event)).await,
                    None => {
                        self.media = None;
                        self.apply(Input::Media(MediaEvent::Ended)).await;
                    }
                },
                _ = elapsed(&mut self.retry) => {
                    self.retry = None;
                    self.apply(Input::RetryElapsed).await;
                }
            }
        }
        debug!("session driver exited");
    }

    async fn complete(&mut self, done: Completion) {
        match done {
            Completion::Resolved { attempt, result } => {
                self.resolving = None;
                let input = match result {
                    Ok(Resolution { path, readiness }) => Input::Resolved {
                        attempt,
                        path,
                        readiness,
                    },
                    Err(error) => Input::AttachFailed { attempt, error },
                };
                self.apply(input).await;
            }
            Completion::Attached { attempt, result } => match result {
                Ok(mut attachment) => {
                    if self.machine.pending_attempt() != Some(attempt) {
                        debug!("closing transport of stale attempt {}", attempt);
                        attachment.transport.close().await;
                        return;
                    }
                    self.transport = Some(attachment.transport);
                    self.media = Some(attachment.events);
                    self.apply(Input::Attached { attempt }).await;
                }
                Err(error) => self.apply(Input::AttachFailed { attempt, error }).await,
            },
        }
    }

    async fn apply(&mut self, input: Input) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            for action in self.machine.handle(input) {
                if let Some(next) = self.execute(action).await {
                    queue.push_back(next);
                }
            }
        }
        self.state.send_if_modified(|state| {
            let next = self.machine.state();
            if *state != *next {
                *state = next.clone();
                return true;
            }
            false
        });
    }

    async fn execute(&mut self, action: Action) -> Option<Input> {
        match action {
            Action::Resolve { attempt } => {
                let source = self.machine.source()?.clone();
                let connector = self.connector.clone();
                let tx = self.completions_tx.clone();
                if let Some(previous) = self.resolving.take() {
                    previous.abort();
                }
                let task = tokio::spawn(async move {
                    let result = connector.resolve(&source).await;
                    let _ = tx.send(Completion::Resolved { attempt, result });
                });
                self.resolving = Some(task.abort_handle());
            }
            Action::Attach { attempt, path } => self.spawn_attach(attempt, path),
            Action::Recover => {
                if let Some(transport) = self.transport.as_mut() {
                    if let Err(e) = transport.recover().await {
                        return Some(Input::RecoveryFailed(e));
                    }
                }
            }
            Action::ArmRetry(delay) => {
                debug_assert!(self.retry.is_none(), "retry timer already armed");
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
            }
            Action::CancelRetry => self.retry = None,
            Action::Detach => {
                if let Some(resolving) = self.resolving.take() {
                    resolving.abort();
                }
                self.media = None;
                if let Some(mut transport) = self.transport.take() {
                    transport.close().await;
                }
            }
            Action::ReleaseCapture => {
                if let Some(authority) = self.capture.take() {
                    authority.release();
                }
            }
            Action::NotifyReady => {
                info!("stream ready");
                (self.on_ready)();
            }
            Action::Notice(notice) => {
                match &notice {
                    Notice::Reconnecting { attempt, max } => {
                        info!("reconnecting ({}/{})", attempt, max)
                    }
                    Notice::Unrecoverable(reason) => warn!("unrecoverable: {}", reason),
                    Notice::NotReadyYet => warn!("stream not ready yet, attaching anyway"),
                }
                let _ = self.notices.send(notice);
            }
        }
        None
    }

    fn spawn_attach(&self, attempt: u64, path: AttachPath) {
        let Some(source) = self.machine.source().cloned() else {
            return;
        };
        let connector = self.connector.clone();
        let sink = self.sink.clone();
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = match sink.acquire().await {
                Ok(lease) => connector.attach(&source, path, lease).await,
                Err(e) => Err(e),
            };
            // Nobody is listening any more: close what was opened.
            if let Err(mpsc::error::SendError(Completion::Attached {
                result: Ok(mut attachment),
                ..
            })) = tx.send(Completion::Attached { attempt, result })
            {
                attachment.transport.close().await;
            }
        });
    }
}

async fn next_media(media: &mut Option<mpsc::UnboundedReceiver<MediaEvent>>) -> Option<MediaEvent> {
    match media {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use url::Url;

    use super::*;
    use crate::capture::SharedCapture;
    use crate::machine::{Delivery, Source};
    use crate::readiness::Readiness;
    use crate::sink::SinkLease;

    #[derive(Clone)]
    enum Plan {
        Connect { delay: Duration },
        /// Attaches but never delivers a frame
        Silent,
        Fail(SessionError),
    }

    #[derive(Default)]
    struct Counters {
        open: AtomicUsize,
        peak: AtomicUsize,
        attaches: AtomicUsize,
    }

    struct FakeConnector {
        plans: Mutex<VecDeque<Plan>>,
        fallback: Plan,
        counters: Arc<Counters>,
        senders: Mutex<Vec<mpsc::UnboundedSender<MediaEvent>>>,
    }

    impl FakeConnector {
        fn new(plans: Vec<Plan>, fallback: Plan) -> Arc<Self> {
            Arc::new(Self {
                plans: Mutex::new(plans.into()),
                fallback,
                counters: Arc::new(Counters::default()),
                senders: Mutex::new(vec![]),
            })
        }

        fn emit(&self, event: MediaEvent) {
            let senders = self.senders.lock().unwrap();
            let _ = senders.last().unwrap().send(event);
        }

        fn open(&self) -> usize {
            self.counters.open.load(Ordering::SeqCst)
        }

        fn attaches(&self) -> usize {
            self.counters.attaches.load(Ordering::SeqCst)
        }
    }

    struct FakeTransport {
        counters: Arc<Counters>,
        lease: Option<SinkLease>,
    }

    #[async_trait]
    impl MediaTransport for FakeTransport {
        async fn recover(&mut self) -> Result<(), SessionError> {
            Ok(())
        }

        async fn close(&mut self) {
            if self.lease.take().is_some() {
                self.counters.open.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn resolve(&self, _source: &Source) -> Result<Resolution, SessionError> {
            Ok(Resolution {
                path: AttachPath::Signaling,
                readiness: Readiness::Ready { attempts: 0 },
            })
        }

        async fn attach(
            &self,
            _source: &Source,
            _path: AttachPath,
            lease: SinkLease,
        ) -> Result<Attachment, SessionError> {
            self.counters.attaches.fetch_add(1, Ordering::SeqCst);
            let plan = self
                .plans
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            let playing = match plan {
                Plan::Fail(e) => return Err(e),
                Plan::Connect { delay } => {
                    tokio::time::sleep(delay).await;
                    true
                }
                Plan::Silent => false,
            };
            let open = self.counters.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.peak.fetch_max(open, Ordering::SeqCst);
            let (tx, events) = mpsc::unbounded_channel();
            if playing {
                tx.send(MediaEvent::Playing).unwrap();
            }
            self.senders.lock().unwrap().push(tx);
            Ok(Attachment {
                transport: Box::new(FakeTransport {
                    counters: self.counters.clone(),
                    lease: Some(lease),
                }),
                events,
            })
        }
    }

    fn connect() -> Plan {
        Plan::Connect {
            delay: Duration::ZERO,
        }
    }

    fn source(live: bool) -> Source {
        Source::new(
            Url::parse("https://media.example.com/whep/abc").unwrap(),
            Delivery::Whep,
            live,
        )
    }

    fn spawn(connector: Arc<FakeConnector>) -> (MediaSession, OutputSink, Arc<AtomicUsize>) {
        let ready = Arc::new(AtomicUsize::new(0));
        let (sink, _frames) = OutputSink::new();
        let counter = ready.clone();
        let session = MediaSession::spawn(
            connector,
            sink.clone(),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (session, sink, ready)
    }

    async fn wait_for(session: &MediaSession, want: State) {
        let mut state = session.watch_state();
        tokio::time::timeout(Duration::from_secs(600), state.wait_for(|s| *s == want))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_then_stop_releases_everything() {
        let connector = FakeConnector::new(vec![], connect());
        let (session, sink, ready) = spawn(connector.clone());
        session.start(source(true));
        wait_for(&session, State::Connected).await;
        assert_eq!(ready.load(Ordering::SeqCst), 1);
        assert_eq!(connector.open(), 1);
        assert!(sink.is_attached());

        session.stop().await;
        assert_eq!(session.state(), State::Closed);
        assert_eq!(connector.open(), 0);
        assert!(!sink.is_attached());

        session.stop().await;
        assert_eq!(session.state(), State::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let connector = FakeConnector::new(
            vec![],
            Plan::Fail(SessionError::Transport("refused".to_string())),
        );
        let (session, _sink, ready) = spawn(connector.clone());
        let mut notices = session.notices();
        session.start(source(true));

        assert!(matches!(session.wait_terminal().await, State::Failed(_)));
        assert_eq!(connector.attaches(), 10);
        assert_eq!(ready.load(Ordering::SeqCst), 0);

        let mut reconnecting = 0;
        let mut last = None;
        while let Ok(notice) = notices.try_recv() {
            if matches!(notice, Notice::Reconnecting { .. }) {
                reconnecting += 1;
            }
            last = Some(notice);
        }
        assert_eq!(reconnecting, 9);
        assert!(matches!(last, Some(Notice::Unrecoverable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_demand_failure_is_terminal() {
        let connector = FakeConnector::new(
            vec![],
            Plan::Fail(SessionError::Negotiation(503)),
        );
        let (session, _sink, _ready) = spawn(connector.clone());
        session.start(source(false));
        assert!(matches!(session.wait_terminal().await, State::Failed(_)));
        assert_eq!(connector.attaches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_once_across_reconnects() {
        let connector = FakeConnector::new(vec![], connect());
        let (session, _sink, ready) = spawn(connector.clone());
        session.start(source(true));
        wait_for(&session, State::Connected).await;

        for _ in 0..3 {
            connector.emit(MediaEvent::Fatal(SessionError::Transport(
                "ice failed".to_string(),
            )));
            wait_for(&session, State::Retrying).await;
            assert_eq!(connector.open(), 0);
            tokio::time::sleep(Duration::from_secs(10)).await;
            assert_eq!(session.state(), State::Connected);
        }
        assert_eq!(ready.load(Ordering::SeqCst), 1);
        assert_eq!(connector.attaches(), 4);
        assert_eq!(connector.open(), 1);
        assert_eq!(connector.counters.peak.load(Ordering::SeqCst), 1);
        session.stop().await;
        assert_eq!(connector.open(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_transport_is_replaced() {
        let connector = FakeConnector::new(vec![Plan::Silent], connect());
        let (session, _sink, ready) = spawn(connector.clone());
        let mut notices = session.notices();
        session.start(source(true));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(session.state(), State::Negotiating);
        assert_eq!(connector.open(), 1);

        wait_for(&session, State::Retrying).await;
        assert_eq!(connector.open(), 0);
        assert_eq!(
            notices.recv().await.unwrap(),
            Notice::Reconnecting { attempt: 1, max: 10 }
        );

        wait_for(&session, State::Connected).await;
        assert_eq!(connector.attaches(), 2);
        assert_eq!(connector.open(), 1);
        assert_eq!(ready.load(Ordering::SeqCst), 1);
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_attachment_after_stop_is_closed() {
        let connector = FakeConnector::new(
            vec![Plan::Connect {
                delay: Duration::from_secs(10),
            }],
            connect(),
        );
        let (session, sink, ready) = spawn(connector.clone());
        session.start(source(true));
        tokio::time::sleep(Duration::from_secs(1)).await;
        session.stop().await;
        assert_eq!(session.state(), State::Closed);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(connector.attaches(), 1);
        assert_eq!(connector.open(), 0);
        assert!(!sink.is_attached());
        assert_eq!(session.state(), State::Closed);
        assert_eq!(ready.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_change_never_overlaps_transports() {
        let connector = FakeConnector::new(vec![], connect());
        let (session, _sink, ready) = spawn(connector.clone());
        session.start(source(true));
        wait_for(&session, State::Connected).await;

        session.start(Source::new(
            Url::parse("https://media.example.com/whep/other").unwrap(),
            Delivery::Whep,
            true,
        ));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(session.state(), State::Connected);
        assert_eq!(connector.attaches(), 2);
        assert_eq!(connector.counters.peak.load(Ordering::SeqCst), 1);
        assert_eq!(connector.open(), 1);
        assert_eq!(ready.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_adopted_capture() {
        let (capture, authority) = SharedCapture::new(vec![]);
        let connector = FakeConnector::new(vec![], connect());
        let (session, _sink, _ready) = spawn(connector);
        session.adopt_capture(authority);
        session.start(source(true));
        wait_for(&session, State::Connected).await;
        session.stop().await;
        assert!(capture.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn test_preserved_capture_survives_stop() {
        let (capture, authority) = SharedCapture::new(vec![]);
        let connector = FakeConnector::new(vec![], connect());
        let (session, _sink, _ready) = spawn(connector.clone());
        session.adopt_capture(authority);
        session.start(source(true));
        wait_for(&session, State::Connected).await;

        let authority = session.preserve_capture().await.unwrap();
        drop(session);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.open(), 0);
        assert!(!capture.is_released());

        authority.release();
        assert!(capture.is_released());
    }
}
