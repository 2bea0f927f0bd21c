//! Ordered failover across several endpoints.
//!
//! The strategy talks to one endpoint at a time, starting with the first.
//! When the current session has failed `retries` times in a row the next
//! endpoint in order gets a fresh session; after the last endpoint it
//! wraps around to the first. A session that fails fewer times than that
//! reconnects to the same endpoint on its own.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Strategy, StrategyKind, StrategyListener, owned_by, relay_job, submit_to};
use crate::endpoint::Endpoint;
use crate::error::{ConfigError, StrategyError};
use crate::job::{Algorithm, JobResult};
use crate::session::{Session, SessionEvent, SessionFactory, SessionMessage};
use crate::timer::Timer;

/// Retry policy shared by the single and failover strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverOptions {
    /// Consecutive failures tolerated before moving to the next endpoint.
    /// Zero moves on after the first failure.
    pub retries: u32,

    /// Delay before reconnecting, to the same endpoint or the next one
    pub retry_pause: Duration,

    /// Log connection churn at debug level
    pub quiet: bool,
}

impl Default for FailoverOptions {
    fn default() -> Self {
        Self {
            retries: 5,
            retry_pause: Duration::from_secs(5),
            quiet: false,
        }
    }
}

pub struct FailoverStrategy {
    kind: StrategyKind,
    endpoints: Vec<Endpoint>,
    options: FailoverOptions,
    factory: Arc<dyn SessionFactory>,
    index: usize,
    session: Option<Box<dyn Session>>,
    retired: Vec<Box<dyn Session>>,
    /// Deferred connect of a freshly switched-to session
    pending_connect: Timer,
    algorithm: Option<Algorithm>,
    active: bool,
    /// A login succeeded since the rotation last passed the first endpoint
    logged_in: bool,
}

impl FailoverStrategy {
    pub fn new(
        kind: StrategyKind,
        endpoints: Vec<Endpoint>,
        options: FailoverOptions,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, ConfigError> {
        let endpoints: Vec<Endpoint> = endpoints.into_iter().filter(|e| e.is_enabled()).collect();
        if endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        Ok(Self {
            kind,
            endpoints,
            options,
            factory,
            index: 0,
            session: None,
            retired: Vec::new(),
            pending_connect: Timer::new(),
            algorithm: None,
            active: false,
            logged_in: false,
        })
    }

    /// Index of the endpoint currently in use.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Replace the current session with a new one for `index`.
    ///
    /// The new session exists before the old one is retired, so there is
    /// never a moment without a current session.
    fn switch_to(
        &mut self,
        index: usize,
        now: Instant,
        delay: Duration,
        listener: &mut dyn StrategyListener,
    ) {
        self.index = index;

        let mut session = self.factory.create(&self.endpoints[index]);
        session.set_quiet(self.options.quiet);
        session.set_retry_pause(self.options.retry_pause);
        session.set_algorithm(self.algorithm.clone());

        if let Some(mut old) = self.session.replace(session) {
            old.disconnect();
            self.retired.push(old);
        }

        if delay.is_zero() {
            self.pending_connect.stop();
            self.connect_current(listener);
        } else {
            self.pending_connect.start(now, delay, None);
        }
    }

    fn connect_current(&mut self, listener: &mut dyn StrategyListener) {
        let endpoint = &self.endpoints[self.index];
        let login = listener.login_params(self.kind, endpoint);

        if let Some(session) = self.session.as_mut() {
            debug!(
                pool = %endpoint,
                session = %session.id(),
                index = self.index,
                kind = ?self.kind,
                "Connecting"
            );
            session.connect(login);
        }
    }

    fn on_disconnected(&mut self, failures: u32, now: Instant, listener: &mut dyn StrategyListener) {
        if self.active {
            self.active = false;
            listener.on_pause(self.kind);
        }

        if failures < self.options.retries {
            if !self.options.quiet {
                warn!(
                    pool = %self.endpoints[self.index],
                    failures,
                    retries = self.options.retries,
                    retry_in_secs = self.options.retry_pause.as_secs(),
                    "Pool connection lost, retrying"
                );
            }
            return;
        }

        let next = (self.index + 1) % self.endpoints.len();

        if next == 0 {
            if !self.logged_in {
                listener.on_connect_failed(self.kind, &self.endpoints[self.index], failures);
            }
            self.logged_in = false;
        }

        if !self.options.quiet {
            warn!(
                pool = %self.endpoints[self.index],
                failures,
                next = %self.endpoints[next],
                retry_in_secs = self.options.retry_pause.as_secs(),
                "Pool failed, switching to next endpoint"
            );
        }

        self.switch_to(next, now, self.options.retry_pause, listener);
    }
}

impl Strategy for FailoverStrategy {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn connect(&mut self, now: Instant, listener: &mut dyn StrategyListener) {
        self.active = false;
        self.logged_in = false;
        self.switch_to(0, now, Duration::ZERO, listener);
    }

    fn submit(&mut self, result: &JobResult) -> Result<u64, StrategyError> {
        submit_to(self.session.as_mut(), self.active, result)
    }

    fn tick(&mut self, now: Instant, listener: &mut dyn StrategyListener) {
        self.retired.clear();

        if self.pending_connect.poll(now) {
            self.connect_current(listener);
        }

        if let Some(session) = self.session.as_mut() {
            session.tick(now);
        }
    }

    fn stop(&mut self) {
        self.pending_connect.stop();
        if let Some(mut session) = self.session.take() {
            session.disconnect();
            self.retired.push(session);
        }
        self.active = false;
    }

    fn set_algorithm(&mut self, algorithm: Option<Algorithm>) {
        self.algorithm = algorithm.clone();
        if let Some(session) = self.session.as_mut() {
            session.set_algorithm(algorithm);
        }
    }

    fn handle_message(
        &mut self,
        msg: &SessionMessage,
        now: Instant,
        listener: &mut dyn StrategyListener,
    ) -> bool {
        if !owned_by(&self.session, msg.session) {
            return false;
        }

        match &msg.event {
            SessionEvent::Connected => {
                debug!(pool = %self.endpoints[self.index], session = %msg.session, "Transport connected");
            }
            SessionEvent::LoginSuccess => {
                self.logged_in = true;
                if !self.active {
                    self.active = true;
                    if !self.options.quiet {
                        info!(pool = %self.endpoints[self.index], index = self.index, "Logged in");
                    }
                    if let Some(session) = self.session.as_deref() {
                        listener.on_active(self.kind, session);
                    }
                }
            }
            SessionEvent::Job { job, raw } => {
                if let Some(session) = self.session.as_deref() {
                    if self.active {
                        relay_job(self.kind, session, job, raw, listener);
                    }
                }
            }
            SessionEvent::ResultAccepted { result, error } => {
                if let Some(session) = self.session.as_deref() {
                    listener.on_result_accepted(self.kind, session, result, error.as_deref());
                }
            }
            SessionEvent::Disconnected { failures } => {
                self.on_disconnected(*failures, now, listener);
            }
        }

        true
    }

    fn resume(&mut self, listener: &mut dyn StrategyListener) {
        if !self.active {
            return;
        }
        if let Some(session) = self.session.as_deref() {
            if let Some((job, raw)) = session.job() {
                relay_job(self.kind, session, &job, &raw, listener);
            }
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn active_session(&self) -> Option<&dyn Session> {
        self.session.as_deref().filter(|_| self.active)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending_connect.deadline()
    }
}
