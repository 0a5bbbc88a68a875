use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::error::SessionError;
use crate::readiness::Readiness;

/// Time an attempt may take to deliver its first good frame.
pub const FIRST_FRAME_DEADLINE: Duration = Duration::from_secs(15);
/// Time in-place recovery may take before the transport is replaced.
pub const RECOVERY_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Subscribe over WHEP
    Whep,
    /// Publish over WHIP
    Whip,
    /// Segmented playlist (HLS)
    Manifest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub url: Url,
    pub delivery: Delivery,
    /// On-demand sources never retry
    pub live: bool,
}

impl Source {
    pub fn new(url: Url, delivery: Delivery, live: bool) -> Self {
        Self {
            url,
            delivery,
            live,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPath {
    Signaling,
    NativeManifest,
    SoftwareManifest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn for_path(path: AttachPath) -> Self {
        match path {
            AttachPath::SoftwareManifest => Self {
                max_attempts: 5,
                backoff: Duration::from_secs(3),
            },
            AttachPath::NativeManifest | AttachPath::Signaling => Self {
                max_attempts: 10,
                backoff: Duration::from_secs(5),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    Negotiating,
    Connected,
    Degraded,
    Retrying,
    Closed,
    Failed(String),
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Closed | State::Failed(_))
    }
}

/// User-visible advisories, distinct from state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Reconnecting { attempt: u32, max: u32 },
    Unrecoverable(String),
    NotReadyYet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// A good frame was observed
    Playing,
    Stall,
    DecodeError(String),
    Fatal(SessionError),
    /// The transport stopped producing events
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Start(Source),
    Stop,
    Resolved {
        attempt: u64,
        path: AttachPath,
        readiness: Readiness,
    },
    Attached {
        attempt: u64,
    },
    AttachFailed {
        attempt: u64,
        error: SessionError,
    },
    Media(MediaEvent),
    RecoveryFailed(SessionError),
    RetryElapsed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Resolve { attempt: u64 },
    Attach { attempt: u64, path: AttachPath },
    /// In-place recovery on the attached transport
    Recover,
    ArmRetry(Duration),
    CancelRetry,
    /// Close whatever transport is attached and drop in-flight attempts
    Detach,
    ReleaseCapture,
    NotifyReady,
    Notice(Notice),
}

/// What the single session timer is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Backoff,
    FirstFrame,
    Recovery,
}

/// Transition core of one media session. Performs no I/O: every effect is
/// returned as an [`Action`] for the driver to execute.
#[derive(Debug)]
pub struct Machine {
    state: State,
    source: Option<Source>,
    path: Option<AttachPath>,
    policy: Option<RetryPolicy>,
    attempt: u64,
    /// Negotiations started since the last good frame
    attempts: u32,
    in_flight: bool,
    attached: bool,
    timer: Option<Timer>,
    ready_fired: bool,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            source: None,
            path: None,
            policy: None,
            attempt: 0,
            attempts: 0,
            in_flight: false,
            attached: false,
            timer: None,
            ready_fired: false,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    /// Attempt whose completion is still awaited, if any.
    pub fn pending_attempt(&self) -> Option<u64> {
        self.in_flight.then_some(self.attempt)
    }

    pub fn retry_armed(&self) -> bool {
        self.timer.is_some()
    }

    pub fn attached(&self) -> bool {
        self.attached
    }

    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        let mut actions = Vec::new();
        match input {
            Input::Start(source) => self.start(source, &mut actions),
            Input::Stop => self.stop(&mut actions),
            Input::Resolved {
                attempt,
                path,
                readiness,
            } => {
                if !self.is_current(attempt) || self.state != State::Connecting {
                    debug!("ignoring stale resolution of attempt {}", attempt);
                    return actions;
                }
                if let Readiness::TimedOut { .. } = readiness {
                    actions.push(Action::Notice(Notice::NotReadyYet));
                }
                self.path = Some(path);
                self.policy = Some(RetryPolicy::for_path(path));
                self.negotiate(&mut actions);
            }
            Input::Attached { attempt } => {
                if !self.is_current(attempt) || self.state != State::Negotiating {
                    debug!("ignoring stale attachment of attempt {}", attempt);
                    return actions;
                }
                self.in_flight = false;
                self.attached = true;
            }
            Input::AttachFailed { attempt, error } => {
                if !self.is_current(attempt) || !self.is_pending_state() {
                    return actions;
                }
                self.in_flight = false;
                warn!("attempt {} failed: {}", attempt, error);
                self.fatal(error, &mut actions);
            }
            Input::Media(event) => self.media(event, &mut actions),
            Input::RecoveryFailed(error) => {
                if self.state != State::Degraded {
                    return actions;
                }
                warn!("recovery failed: {}", error);
                if self.is_live() {
                    self.retry(error, &mut actions);
                } else {
                    self.fail(error.to_string(), &mut actions);
                }
            }
            Input::RetryElapsed => match (self.timer.take(), self.state.clone()) {
                (Some(Timer::Backoff), State::Retrying) => self.negotiate(&mut actions),
                (Some(Timer::FirstFrame), State::Negotiating) => {
                    warn!("no media within {:?}", FIRST_FRAME_DEADLINE);
                    self.fatal(
                        SessionError::Transport("no media before deadline".to_string()),
                        &mut actions,
                    );
                }
                (Some(Timer::Recovery), State::Degraded) => {
                    warn!("recovery did not complete within {:?}", RECOVERY_DEADLINE);
                    self.fatal(
                        SessionError::Transport("recovery timed out".to_string()),
                        &mut actions,
                    );
                }
                (timer, state) => debug!("timer {:?} ignored in {:?}", timer, state),
            },
        }
        actions
    }

    fn start(&mut self, source: Source, actions: &mut Vec<Action>) {
        if !matches!(self.state, State::Idle | State::Closed | State::Failed(_)) {
            info!("source changed, tearing down current attempt");
            self.teardown(actions);
        }
        self.source = Some(source);
        self.path = None;
        self.policy = None;
        self.attempts = 0;
        self.ready_fired = false;
        self.attempt += 1;
        self.in_flight = true;
        self.transition(State::Connecting);
        actions.push(Action::Resolve {
            attempt: self.attempt,
        });
    }

    fn stop(&mut self, actions: &mut Vec<Action>) {
        if self.state.is_terminal() {
            return;
        }
        self.teardown(actions);
        actions.push(Action::ReleaseCapture);
        self.transition(State::Closed);
    }

    fn media(&mut self, event: MediaEvent, actions: &mut Vec<Action>) {
        match (event, &self.state) {
            (MediaEvent::Playing, State::Negotiating) if self.attached => {
                self.disarm(actions);
                self.attempts = 0;
                self.transition(State::Connected);
                if !self.ready_fired {
                    self.ready_fired = true;
                    actions.push(Action::NotifyReady);
                }
            }
            (MediaEvent::Playing, State::Degraded) => {
                self.disarm(actions);
                self.attempts = 0;
                self.transition(State::Connected);
            }
            (MediaEvent::Stall | MediaEvent::DecodeError(_), State::Connected) => {
                self.transition(State::Degraded);
                actions.push(Action::Recover);
                self.arm(Timer::Recovery, RECOVERY_DEADLINE, actions);
            }
            (MediaEvent::Fatal(error), State::Negotiating | State::Connected | State::Degraded)
                if self.attached =>
            {
                warn!("fatal media error: {}", error);
                self.fatal(error, actions);
            }
            (MediaEvent::Ended, State::Negotiating | State::Connected | State::Degraded)
                if self.attached =>
            {
                if self.is_live() {
                    self.retry(SessionError::Transport("media ended".to_string()), actions);
                } else {
                    info!("on-demand source finished");
                    self.stop(actions);
                }
            }
            (event, state) => debug!("media event {:?} ignored in {:?}", event, state),
        }
    }

    fn fatal(&mut self, error: SessionError, actions: &mut Vec<Action>) {
        if self.is_live() && error.is_retryable() {
            self.retry(error, actions);
        } else {
            self.fail(error.to_string(), actions);
        }
    }

    fn retry(&mut self, error: SessionError, actions: &mut Vec<Action>) {
        let Some(policy) = self.policy else {
            self.fail(error.to_string(), actions);
            return;
        };
        if self.attempts >= policy.max_attempts {
            self.fail(
                format!("gave up after {} attempts: {}", self.attempts, error),
                actions,
            );
            return;
        }
        self.detach(actions);
        self.arm(Timer::Backoff, policy.backoff, actions);
        actions.push(Action::Notice(Notice::Reconnecting {
            attempt: self.attempts + 1,
            max: policy.max_attempts,
        }));
        self.transition(State::Retrying);
    }

    fn negotiate(&mut self, actions: &mut Vec<Action>) {
        let Some(path) = self.path else {
            return;
        };
        self.attempt += 1;
        self.attempts += 1;
        self.in_flight = true;
        self.transition(State::Negotiating);
        actions.push(Action::Attach {
            attempt: self.attempt,
            path,
        });
        self.arm(Timer::FirstFrame, FIRST_FRAME_DEADLINE, actions);
    }

    fn fail(&mut self, reason: String, actions: &mut Vec<Action>) {
        self.teardown(actions);
        actions.push(Action::ReleaseCapture);
        actions.push(Action::Notice(Notice::Unrecoverable(reason.clone())));
        self.transition(State::Failed(reason));
    }

    fn teardown(&mut self, actions: &mut Vec<Action>) {
        self.disarm(actions);
        self.detach(actions);
    }

    /// Replaces whatever the timer was waiting for.
    fn arm(&mut self, timer: Timer, delay: Duration, actions: &mut Vec<Action>) {
        if self.timer.replace(timer).is_some() {
            actions.push(Action::CancelRetry);
        }
        actions.push(Action::ArmRetry(delay));
    }

    fn disarm(&mut self, actions: &mut Vec<Action>) {
        if self.timer.take().is_some() {
            actions.push(Action::CancelRetry);
        }
    }

    fn detach(&mut self, actions: &mut Vec<Action>) {
        if self.attached || self.in_flight {
            // Anything still in flight completes as stale.
            self.attempt += 1;
            self.attached = false;
            self.in_flight = false;
            actions.push(Action::Detach);
        }
    }

    fn transition(&mut self, next: State) {
        if self.state != next {
            info!("session {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.in_flight && attempt == self.attempt
    }

    fn is_pending_state(&self) -> bool {
        matches!(self.state, State::Connecting | State::Negotiating)
    }

    fn is_live(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.live)
    }
}
