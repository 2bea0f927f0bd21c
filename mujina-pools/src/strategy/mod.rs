//! Pool selection strategies.
//!
//! A strategy decides which endpoint to talk to and when. Strategies are
//! plain state machines: they never block or spawn, and are driven by three
//! kinds of input, all carrying the current time:
//!
//! - [`Strategy::handle_message`] for events reported by their sessions
//! - [`Strategy::tick`] for timers
//! - direct calls such as [`Strategy::connect`] and [`Strategy::stop`]
//!
//! Outcomes are reported to a [`StrategyListener`] passed into each call,
//! which keeps ownership one-directional: the owner holds the strategy and
//! lends it a listener, the strategy never holds a reference back.

pub mod auxiliary;
pub mod failover;
pub mod single;

pub use auxiliary::{AuxState, AuxiliaryStrategy, PrimarySnapshot};
pub use failover::{FailoverOptions, FailoverStrategy};
pub use single::SinglePoolStrategy;

use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;
use tracing::warn;

use crate::endpoint::Endpoint;
use crate::error::{ConfigError, StrategyError};
use crate::job::{Algorithm, Job, JobResult, LoginParams, SubmitResult};
use crate::session::{Session, SessionFactory, SessionId, SessionMessage};

/// Which role a strategy plays. Passed to every listener callback so one
/// listener can serve both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Primary,
    Auxiliary,
}

/// Receiver of strategy outcomes.
pub trait StrategyListener {
    /// A strategy has a logged-in session ready for work.
    fn on_active(&mut self, kind: StrategyKind, session: &dyn Session);

    /// A strategy lost its working session.
    fn on_pause(&mut self, kind: StrategyKind);

    fn on_job(&mut self, kind: StrategyKind, session: &dyn Session, job: &Job, raw: &Value);

    fn on_result_accepted(
        &mut self,
        kind: StrategyKind,
        session: &dyn Session,
        result: &SubmitResult,
        error: Option<&str>,
    );

    /// Return false to drop jobs for an algorithm we can't run.
    fn on_verify_algorithm(
        &mut self,
        kind: StrategyKind,
        session: &dyn Session,
        algorithm: &Algorithm,
    ) -> bool;

    /// Extra login fields for a session about to connect.
    fn login_params(&mut self, _kind: StrategyKind, _endpoint: &Endpoint) -> Option<LoginParams> {
        None
    }

    /// Every configured endpoint failed before any login succeeded.
    fn on_connect_failed(&mut self, _kind: StrategyKind, _endpoint: &Endpoint, _failures: u32) {}
}

/// Capability shared by every strategy.
pub trait Strategy {
    fn kind(&self) -> StrategyKind;

    /// Begin connecting.
    fn connect(&mut self, now: Instant, listener: &mut dyn StrategyListener);

    /// Forward a result to the active session.
    fn submit(&mut self, result: &JobResult) -> Result<u64, StrategyError>;

    /// Fire due timers and tear down retired sessions.
    fn tick(&mut self, now: Instant, listener: &mut dyn StrategyListener);

    /// Disconnect everything. Idempotent; emits no notifications.
    fn stop(&mut self);

    /// Pin or clear the algorithm for current and future sessions.
    fn set_algorithm(&mut self, algorithm: Option<Algorithm>);

    /// Process an event from a session. Returns false when the session
    /// isn't one of ours, so the caller can offer it elsewhere.
    fn handle_message(
        &mut self,
        msg: &SessionMessage,
        now: Instant,
        listener: &mut dyn StrategyListener,
    ) -> bool;

    /// Re-emit the active session's latest job.
    fn resume(&mut self, listener: &mut dyn StrategyListener);

    fn is_active(&self) -> bool;

    /// The logged-in session, if the strategy is active.
    fn active_session(&self) -> Option<&dyn Session>;

    /// Earliest instant at which [`Strategy::tick`] has work to do.
    fn next_deadline(&self) -> Option<Instant>;
}

/// Primary strategy chosen from the endpoint count.
pub enum PoolStrategy {
    Single(SinglePoolStrategy),
    Failover(FailoverStrategy),
}

impl PoolStrategy {
    /// Build a strategy over the enabled endpoints.
    ///
    /// One enabled endpoint gives a [`SinglePoolStrategy`], more give a
    /// [`FailoverStrategy`].
    pub fn new(
        kind: StrategyKind,
        endpoints: Vec<Endpoint>,
        options: FailoverOptions,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, ConfigError> {
        let mut endpoints: Vec<Endpoint> = endpoints.into_iter().filter(|e| e.is_enabled()).collect();

        match endpoints.len() {
            0 => Err(ConfigError::NoEndpoints),
            1 => {
                let endpoint = endpoints.remove(0);
                Ok(PoolStrategy::Single(SinglePoolStrategy::new(
                    kind, endpoint, options, factory,
                )))
            }
            _ => Ok(PoolStrategy::Failover(FailoverStrategy::new(
                kind, endpoints, options, factory,
            )?)),
        }
    }

    fn inner(&self) -> &dyn Strategy {
        match self {
            PoolStrategy::Single(s) => s,
            PoolStrategy::Failover(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Strategy {
        match self {
            PoolStrategy::Single(s) => s,
            PoolStrategy::Failover(s) => s,
        }
    }
}

impl Strategy for PoolStrategy {
    fn kind(&self) -> StrategyKind {
        self.inner().kind()
    }

    fn connect(&mut self, now: Instant, listener: &mut dyn StrategyListener) {
        self.inner_mut().connect(now, listener)
    }

    fn submit(&mut self, result: &JobResult) -> Result<u64, StrategyError> {
        self.inner_mut().submit(result)
    }

    fn tick(&mut self, now: Instant, listener: &mut dyn StrategyListener) {
        self.inner_mut().tick(now, listener)
    }

    fn stop(&mut self) {
        self.inner_mut().stop()
    }

    fn set_algorithm(&mut self, algorithm: Option<Algorithm>) {
        self.inner_mut().set_algorithm(algorithm)
    }

    fn handle_message(
        &mut self,
        msg: &SessionMessage,
        now: Instant,
        listener: &mut dyn StrategyListener,
    ) -> bool {
        self.inner_mut().handle_message(msg, now, listener)
    }

    fn resume(&mut self, listener: &mut dyn StrategyListener) {
        self.inner_mut().resume(listener)
    }

    fn is_active(&self) -> bool {
        self.inner().is_active()
    }

    fn active_session(&self) -> Option<&dyn Session> {
        self.inner().active_session()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner().next_deadline()
    }
}

/// Whether `msg` came from `session`.
pub(crate) fn owned_by(session: &Option<Box<dyn Session>>, id: SessionId) -> bool {
    session.as_ref().is_some_and(|s| s.id() == id)
}

/// Check a job's algorithm and pass it on. Returns false if rejected.
pub(crate) fn relay_job(
    kind: StrategyKind,
    session: &dyn Session,
    job: &Job,
    raw: &Value,
    listener: &mut dyn StrategyListener,
) -> bool {
    if !listener.on_verify_algorithm(kind, session, &job.algorithm) {
        warn!(
            pool = %session.endpoint(),
            algorithm = %job.algorithm,
            job_id = %job.id,
            "Job for unsupported algorithm ignored"
        );
        return false;
    }

    listener.on_job(kind, session, job, raw);
    true
}

/// Submit through `session` if it is logged in.
pub(crate) fn submit_to(
    session: Option<&mut Box<dyn Session>>,
    active: bool,
    result: &JobResult,
) -> Result<u64, StrategyError> {
    match session {
        Some(session) if active && session.is_connected() => session.submit(result),
        _ => Err(StrategyError::NotConnected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::MockFactory;
    use std::time::Duration;

    fn options() -> FailoverOptions {
        FailoverOptions {
            retries: 2,
            retry_pause: Duration::from_secs(5),
            quiet: false,
        }
    }

    #[test]
    fn strategy_shape_follows_enabled_endpoint_count() {
        let factory = MockFactory::new();

        let one = vec![
            Endpoint::new("a", 1),
            Endpoint::new("b", 2).with_enabled(false),
        ];
        let strategy =
            PoolStrategy::new(StrategyKind::Primary, one, options(), factory.clone()).unwrap();
        assert!(matches!(strategy, PoolStrategy::Single(_)));

        let two = vec![Endpoint::new("a", 1), Endpoint::new("b", 2)];
        let strategy =
            PoolStrategy::new(StrategyKind::Primary, two, options(), factory.clone()).unwrap();
        assert!(matches!(strategy, PoolStrategy::Failover(_)));
    }

    #[test]
    fn no_enabled_endpoints_is_a_config_error() {
        let factory = MockFactory::new();
        let endpoints = vec![Endpoint::new("a", 1).with_enabled(false)];

        let result = PoolStrategy::new(StrategyKind::Primary, endpoints, options(), factory);
        assert!(matches!(result, Err(ConfigError::NoEndpoints)));
    }
}
