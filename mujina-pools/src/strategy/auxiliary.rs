//! Time-boxed auxiliary session.
//!
//! The auxiliary strategy periodically takes over work for a short active
//! period and then steps back for a longer idle period; the ratio is set by
//! the configured level. Each cycle runs through a small state machine:
//!
//! ```text
//!   New ──▶ Idle ──timer──▶ Connecting ──login──▶ Active ──timer──▶ Wait
//!            ▲                  │                                   │
//!            └──── failure ─────┘◀────────── wait window ───────────┘
//! ```
//!
//! While connecting it either opens its own connections through a delegate
//! [`PoolStrategy`] over the auxiliary endpoints, or, when the primary pool
//! supports the `connect` extension, tunnels a session through the primary
//! pool's endpoint.
//!
//! The delegate reports to the auxiliary strategy, never directly to the
//! outer listener. Calls into the delegate go through a [`Relay`] that
//! forwards jobs and results and queues activation and failure signals,
//! which are applied once the delegate call has returned.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tokio::time::Instant;

use super::{
    FailoverOptions, PoolStrategy, Strategy, StrategyKind, StrategyListener, owned_by, relay_job,
};
use crate::config::{AuxiliaryConfig, TunnelMode};
use crate::endpoint::{Endpoint, LoginMode};
use crate::error::{ConfigError, StrategyError};
use crate::job::{Algorithm, Job, JobResult, LoginParams, SubmitResult};
use crate::session::{Extension, Session, SessionEvent, SessionFactory, SessionMessage};
use crate::timer::Timer;
use crate::tracing::prelude::*;

const KIND: StrategyKind = StrategyKind::Auxiliary;

/// Auxiliary lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxState {
    New,
    Idle,
    Connecting,
    Active,
    Wait,
}

/// What the auxiliary strategy needs to know about the primary's active
/// session to decide whether to tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimarySnapshot {
    pub endpoint: Endpoint,
    pub secure: bool,
    pub tunnel_capable: bool,
}

impl PrimarySnapshot {
    pub fn of(session: &dyn Session) -> Self {
        Self {
            endpoint: session.endpoint().clone(),
            secure: session.is_secure(),
            tunnel_capable: session.supports_extension(Extension::Connect),
        }
    }
}

/// Parameters of the last primary job, echoed in auxiliary logins.
#[derive(Debug, Clone, Default)]
struct JobShape {
    algorithm: Option<Algorithm>,
    diff: u64,
    height: u64,
    seed_hash: Vec<u8>,
}

enum Signal {
    Activated,
    ConnectFailed { endpoint: Endpoint, failures: u32 },
}

/// Listener handed to the delegate.
struct Relay<'a> {
    state: AuxState,
    login: LoginParams,
    listener: &'a mut dyn StrategyListener,
    signals: Vec<Signal>,
}

impl StrategyListener for Relay<'_> {
    fn on_active(&mut self, _kind: StrategyKind, _session: &dyn Session) {
        self.signals.push(Signal::Activated);
    }

    // The auxiliary strategy's own timer decides when work pauses.
    fn on_pause(&mut self, _kind: StrategyKind) {}

    fn on_job(&mut self, _kind: StrategyKind, session: &dyn Session, job: &Job, raw: &Value) {
        if self.state == AuxState::Active {
            self.listener.on_job(KIND, session, job, raw);
        }
    }

    fn on_result_accepted(
        &mut self,
        _kind: StrategyKind,
        session: &dyn Session,
        result: &SubmitResult,
        error: Option<&str>,
    ) {
        self.listener
            .on_result_accepted(KIND, session, result, error);
    }

    fn on_verify_algorithm(
        &mut self,
        _kind: StrategyKind,
        session: &dyn Session,
        algorithm: &Algorithm,
    ) -> bool {
        self.listener.on_verify_algorithm(KIND, session, algorithm)
    }

    fn login_params(&mut self, _kind: StrategyKind, _endpoint: &Endpoint) -> Option<LoginParams> {
        Some(self.login.clone())
    }

    fn on_connect_failed(&mut self, _kind: StrategyKind, endpoint: &Endpoint, failures: u32) {
        self.signals.push(Signal::ConnectFailed {
            endpoint: endpoint.clone(),
            failures,
        });
    }
}

/// Listener for transitions that happen outside any caller's call.
struct Silent;

impl StrategyListener for Silent {
    fn on_active(&mut self, _: StrategyKind, _: &dyn Session) {}
    fn on_pause(&mut self, _: StrategyKind) {}
    fn on_job(&mut self, _: StrategyKind, _: &dyn Session, _: &Job, _: &Value) {}
    fn on_result_accepted(&mut self, _: StrategyKind, _: &dyn Session, _: &SubmitResult, _: Option<&str>) {}
    fn on_verify_algorithm(&mut self, _: StrategyKind, _: &dyn Session, _: &Algorithm) -> bool {
        false
    }
}

pub struct AuxiliaryStrategy {
    state: AuxState,
    delegate: PoolStrategy,
    tunnel: Option<Box<dyn Session>>,
    retired: Vec<Box<dyn Session>>,
    factory: Arc<dyn SessionFactory>,

    endpoints: Vec<Endpoint>,
    algorithms: Vec<Algorithm>,
    shape: JobShape,
    primary: Option<PrimarySnapshot>,

    timer: Timer,
    wait_until: Option<Instant>,
    now: Instant,
    rng: StdRng,

    active_time: Duration,
    idle_time: Duration,
    first_idle_jitter: (f64, f64),
    idle_jitter: (f64, f64),
    connect_retry_delay: Duration,
    wait_window: Duration,
    retry_pause: Duration,
    tunnel_mode: TunnelMode,
    tunnel_failure_threshold: u32,

    /// Tunnel failures since the last tunnel login, across sessions
    tunnel_failures: u32,
    /// Next connect skips the tunnel
    force_delegate: bool,
    stopped: bool,
}

impl AuxiliaryStrategy {
    /// Build the strategy and schedule the first activation.
    ///
    /// `algorithms` is the list advertised in auxiliary logins.
    pub fn new(
        config: &AuxiliaryConfig,
        algorithms: Vec<Algorithm>,
        factory: Arc<dyn SessionFactory>,
        now: Instant,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let options = FailoverOptions {
            retries: config.retries,
            retry_pause: config.retry_pause(),
            quiet: true,
        };
        let delegate = PoolStrategy::new(KIND, config.endpoints.clone(), options, factory.clone())?;

        let seed = config.seed.unwrap_or_else(rand::random);

        let mut strategy = Self {
            state: AuxState::New,
            delegate,
            tunnel: None,
            retired: Vec::new(),
            factory,
            endpoints: config
                .endpoints
                .iter()
                .filter(|e| e.is_enabled())
                .cloned()
                .collect(),
            algorithms,
            shape: JobShape::default(),
            primary: None,
            timer: Timer::new(),
            wait_until: None,
            now,
            rng: StdRng::seed_from_u64(seed),
            active_time: config.active_duration(),
            idle_time: config.idle_duration(),
            first_idle_jitter: config.first_idle_jitter,
            idle_jitter: config.idle_jitter,
            connect_retry_delay: config.connect_retry_delay(),
            wait_window: config.wait_window(),
            retry_pause: config.retry_pause(),
            tunnel_mode: config.tunnel,
            tunnel_failure_threshold: config.tunnel_failure_threshold,
            tunnel_failures: 0,
            force_delegate: false,
            stopped: false,
        };

        info!(
            level = config.level,
            active_secs = strategy.active_time.as_secs(),
            idle_secs = strategy.idle_time.as_secs(),
            tunnel = ?strategy.tunnel_mode,
            "Auxiliary strategy configured"
        );

        strategy.set_state(AuxState::Idle, &mut Silent);
        Ok(strategy)
    }

    pub fn state(&self) -> AuxState {
        self.state
    }

    pub fn active_duration(&self) -> Duration {
        self.active_time
    }

    pub fn idle_duration(&self) -> Duration {
        self.idle_time
    }

    /// Tell the strategy about the primary's active session (or its absence).
    /// Consulted at the next connect.
    pub fn set_primary(&mut self, primary: Option<PrimarySnapshot>) {
        self.primary = primary;
    }

    /// Record the shape of the primary's latest job.
    pub fn update(&mut self, job: &Job) {
        self.shape = JobShape {
            algorithm: Some(job.algorithm.clone()),
            diff: job.diff,
            height: job.height,
            seed_hash: job.seed_hash.clone(),
        };
    }

    /// Login fields for own auxiliary connections.
    pub fn login_params(&self) -> LoginParams {
        LoginParams::pool(
            &self.algorithms,
            self.shape.algorithm.as_ref(),
            self.shape.diff,
            self.shape.height,
            &self.shape.seed_hash,
        )
    }

    /// Login fields for a tunnel whose transport is `secure`.
    ///
    /// Points at the first auxiliary endpoint whose TLS flag matches, or at
    /// the first endpoint if none does.
    pub fn tunnel_login_params(&self, secure: bool) -> LoginParams {
        let url = self
            .endpoints
            .iter()
            .find(|e| e.is_tls() == secure)
            .or_else(|| self.endpoints.first())
            .map(Endpoint::url)
            .unwrap_or_default();
        LoginParams::tunnel(url)
    }

    fn set_state(&mut self, next: AuxState, listener: &mut dyn StrategyListener) {
        debug_assert!(
            next != self.state,
            "auxiliary strategy re-entered {:?}",
            next
        );
        debug_assert!(next != AuxState::New, "auxiliary strategy cannot return to New");
        if next == self.state || next == AuxState::New {
            return;
        }

        let prev = std::mem::replace(&mut self.state, next);
        debug!(from = ?prev, to = ?next, "Auxiliary state change");

        match next {
            AuxState::New => {}
            AuxState::Idle => match prev {
                AuxState::New => self.schedule_idle(self.first_idle_jitter),
                AuxState::Connecting => {
                    self.delegate.stop();
                    self.retire_tunnel();
                    self.timer.start(self.now, self.connect_retry_delay, None);
                }
                _ => {
                    self.delegate.stop();
                    self.retire_tunnel();
                    self.wait_until = None;
                    self.schedule_idle(self.idle_jitter);
                }
            },
            AuxState::Connecting => self.open_session(listener),
            AuxState::Active => self.timer.start(self.now, self.active_time, None),
            AuxState::Wait => {
                self.wait_until = Some(self.now + self.wait_window);
                listener.on_pause(KIND);
            }
        }
    }

    fn schedule_idle(&mut self, (min, max): (f64, f64)) {
        let factor = self.rng.gen_range(min..=max);
        let delay = self.idle_time.mul_f64(factor);
        debug!(delay_secs = delay.as_secs(), "Auxiliary session idle");
        self.timer.start(self.now, delay, None);
    }

    fn open_session(&mut self, listener: &mut dyn StrategyListener) {
        if std::mem::take(&mut self.force_delegate) {
            debug!("Tunnel skipped after repeated failures");
        } else if let Some(tunnel) = self.open_tunnel() {
            self.tunnel = Some(tunnel);
            return;
        }

        let now = self.now;
        self.with_delegate(listener, |delegate, relay| delegate.connect(now, relay));
    }

    fn open_tunnel(&self) -> Option<Box<dyn Session>> {
        if self.tunnel_mode != TunnelMode::Auto {
            return None;
        }
        let primary = self.primary.as_ref().filter(|p| p.tunnel_capable)?;

        let endpoint = primary
            .endpoint
            .clone()
            .with_tls(primary.secure)
            .with_mode(LoginMode::Login);

        let mut session = self.factory.create(&endpoint);
        session.set_quiet(true);
        session.set_retry_pause(self.retry_pause);
        session.set_algorithm(self.shape.algorithm.clone());

        let login = self.tunnel_login_params(primary.secure);
        info!(via = %endpoint, "Auxiliary session tunneled through primary pool");
        session.connect(Some(login));

        Some(session)
    }

    fn retire_tunnel(&mut self) {
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.disconnect();
            self.retired.push(tunnel);
        }
    }

    /// Call into the delegate with a relay as its listener, then apply
    /// whatever the delegate signalled.
    fn with_delegate<R>(
        &mut self,
        listener: &mut dyn StrategyListener,
        f: impl FnOnce(&mut PoolStrategy, &mut dyn StrategyListener) -> R,
    ) -> R {
        let mut relay = Relay {
            state: self.state,
            login: self.login_params(),
            listener: &mut *listener,
            signals: Vec::new(),
        };

        let out = f(&mut self.delegate, &mut relay);
        let signals = std::mem::take(&mut relay.signals);

        for signal in signals {
            match signal {
                Signal::Activated => self.activate(false, listener),
                Signal::ConnectFailed { endpoint, failures } => {
                    if self.state == AuxState::Connecting {
                        warn!(
                            pool = %endpoint,
                            failures,
                            retry_in_secs = self.connect_retry_delay.as_secs(),
                            "Auxiliary pools unreachable"
                        );
                        self.set_state(AuxState::Idle, listener);
                    }
                }
            }
        }

        out
    }

    /// Enter Active on the first login of a cycle and tell the listener.
    fn activate(&mut self, via_tunnel: bool, listener: &mut dyn StrategyListener) {
        match self.state {
            AuxState::Connecting => {
                self.set_state(AuxState::Active, listener);

                let session = if via_tunnel {
                    self.tunnel.as_deref()
                } else {
                    self.delegate.active_session()
                };
                if let Some(session) = session {
                    info!(pool = %session.endpoint(), "Auxiliary session started");
                    listener.on_active(KIND, session);
                }
            }
            AuxState::Active => debug!("Repeated auxiliary login, activation suppressed"),
            state => debug!(?state, "Auxiliary login outside a cycle ignored"),
        }
    }

    fn handle_tunnel_event(&mut self, event: &SessionEvent, listener: &mut dyn StrategyListener) {
        match event {
            SessionEvent::Connected => debug!("Tunnel transport connected"),
            SessionEvent::LoginSuccess => {
                self.tunnel_failures = 0;
                self.activate(true, listener);
            }
            SessionEvent::Job { job, raw } => {
                if let Some(tunnel) = self.tunnel.as_deref() {
                    if self.state == AuxState::Active {
                        relay_job(KIND, tunnel, job, raw, listener);
                    }
                }
            }
            SessionEvent::ResultAccepted { result, error } => {
                if let Some(tunnel) = self.tunnel.as_deref() {
                    listener.on_result_accepted(KIND, tunnel, result, error.as_deref());
                }
            }
            SessionEvent::Disconnected { failures } => self.on_tunnel_lost(*failures, listener),
        }
    }

    fn on_tunnel_lost(&mut self, failures: u32, listener: &mut dyn StrategyListener) {
        // Counted across tunnel sessions until one logs in
        self.tunnel_failures = self.tunnel_failures.saturating_add(1).max(failures);
        let failures = self.tunnel_failures;

        if self.tunnel_mode == TunnelMode::Auto && failures >= self.tunnel_failure_threshold {
            let err = StrategyError::TunnelUnavailable(format!("{} consecutive failures", failures));
            warn!(error = %err, "Falling back to auxiliary pools");

            self.retire_tunnel();
            self.tunnel_failures = 0;
            self.force_delegate = true;

            if matches!(self.state, AuxState::Connecting | AuxState::Active) {
                let now = self.now;
                self.with_delegate(listener, |delegate, relay| delegate.connect(now, relay));
            }
        } else if self.state == AuxState::Connecting {
            warn!(
                failures,
                retry_in_secs = self.connect_retry_delay.as_secs(),
                "Tunnel login failed"
            );
            self.set_state(AuxState::Idle, listener);
        } else {
            debug!(failures, "Tunnel connection lost, reconnecting");
        }
    }
}

impl Strategy for AuxiliaryStrategy {
    fn kind(&self) -> StrategyKind {
        KIND
    }

    /// Start a cycle now instead of waiting out the idle period.
    fn connect(&mut self, now: Instant, listener: &mut dyn StrategyListener) {
        if self.stopped {
            return;
        }
        self.now = now;
        if self.state == AuxState::Idle {
            self.timer.stop();
            self.set_state(AuxState::Connecting, listener);
        }
    }

    /// Results are accepted through Wait so in-flight work isn't lost.
    fn submit(&mut self, result: &JobResult) -> Result<u64, StrategyError> {
        if self.stopped {
            return Err(StrategyError::NotConnected);
        }

        match self.tunnel.as_mut() {
            Some(tunnel) if tunnel.is_connected() => tunnel.submit(result),
            Some(_) => Err(StrategyError::NotConnected),
            None => self.delegate.submit(result),
        }
    }

    fn tick(&mut self, now: Instant, listener: &mut dyn StrategyListener) {
        if self.stopped {
            return;
        }
        self.now = now;
        self.retired.clear();

        self.with_delegate(listener, |delegate, relay| delegate.tick(now, relay));
        if let Some(tunnel) = self.tunnel.as_mut() {
            tunnel.tick(now);
        }

        if self.timer.poll(now) {
            match self.state {
                AuxState::Idle => self.set_state(AuxState::Connecting, listener),
                AuxState::Active => self.set_state(AuxState::Wait, listener),
                state => debug!(?state, "Auxiliary timer fired with nothing to do"),
            }
        }

        if self.state == AuxState::Wait && self.wait_until.is_some_and(|until| now > until) {
            self.set_state(AuxState::Idle, listener);
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.timer.stop();
        self.wait_until = None;
        self.delegate.stop();
        self.retire_tunnel();
        debug!(state = ?self.state, "Auxiliary strategy stopped");
    }

    fn set_algorithm(&mut self, algorithm: Option<Algorithm>) {
        self.shape.algorithm = algorithm.clone();
        self.delegate.set_algorithm(algorithm.clone());
        if let Some(tunnel) = self.tunnel.as_mut() {
            tunnel.set_algorithm(algorithm);
        }
    }

    fn handle_message(
        &mut self,
        msg: &SessionMessage,
        now: Instant,
        listener: &mut dyn StrategyListener,
    ) -> bool {
        if self.stopped {
            return false;
        }
        self.now = now;

        if owned_by(&self.tunnel, msg.session) {
            self.handle_tunnel_event(&msg.event, listener);
            return true;
        }

        self.with_delegate(listener, |delegate, relay| {
            delegate.handle_message(msg, now, relay)
        })
    }

    fn resume(&mut self, _listener: &mut dyn StrategyListener) {}

    fn is_active(&self) -> bool {
        !self.stopped && self.state == AuxState::Active
    }

    fn active_session(&self) -> Option<&dyn Session> {
        if !self.is_active() {
            return None;
        }
        match self.tunnel.as_deref() {
            Some(tunnel) => Some(tunnel),
            None => self.delegate.active_session(),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        if self.stopped {
            return None;
        }
        [
            self.timer.deadline(),
            self.delegate.next_deadline(),
            self.wait_until.map(|until| until + Duration::from_millis(1)),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}
