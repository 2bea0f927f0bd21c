//! Strategy for a single endpoint.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    FailoverOptions, Strategy, StrategyKind, StrategyListener, owned_by, relay_job, submit_to,
};
use crate::endpoint::Endpoint;
use crate::error::StrategyError;
use crate::job::{Algorithm, JobResult};
use crate::session::{Session, SessionEvent, SessionFactory, SessionMessage};

/// Keeps one session to one endpoint. Reconnects are left to the session.
pub struct SinglePoolStrategy {
    kind: StrategyKind,
    endpoint: Endpoint,
    options: FailoverOptions,
    factory: Arc<dyn SessionFactory>,
    session: Option<Box<dyn Session>>,
    /// Replaced sessions, dropped on the next tick
    retired: Vec<Box<dyn Session>>,
    algorithm: Option<Algorithm>,
    active: bool,
    logged_in: bool,
}

impl SinglePoolStrategy {
    pub fn new(
        kind: StrategyKind,
        endpoint: Endpoint,
        options: FailoverOptions,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            kind,
            endpoint,
            options,
            factory,
            session: None,
            retired: Vec::new(),
            algorithm: None,
            active: false,
            logged_in: false,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn retire_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.disconnect();
            self.retired.push(session);
        }
    }
}

impl Strategy for SinglePoolStrategy {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn connect(&mut self, _now: Instant, listener: &mut dyn StrategyListener) {
        self.retire_session();
        self.active = false;
        self.logged_in = false;

        let mut session = self.factory.create(&self.endpoint);
        session.set_quiet(self.options.quiet);
        session.set_retry_pause(self.options.retry_pause);
        session.set_algorithm(self.algorithm.clone());

        let login = listener.login_params(self.kind, &self.endpoint);
        debug!(pool = %self.endpoint, session = %session.id(), kind = ?self.kind, "Connecting");
        session.connect(login);
        self.session = Some(session);
    }

    fn submit(&mut self, result: &JobResult) -> Result<u64, StrategyError> {
        submit_to(self.session.as_mut(), self.active, result)
    }

    fn tick(&mut self, now: Instant, _listener: &mut dyn StrategyListener) {
        self.retired.clear();
        if let Some(session) = self.session.as_mut() {
            session.tick(now);
        }
    }

    fn stop(&mut self) {
        self.retire_session();
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
        _now: Instant,
        listener: &mut dyn StrategyListener,
    ) -> bool {
        if !owned_by(&self.session, msg.session) {
            return false;
        }
        let Some(session) = self.session.as_deref() else {
            return false;
        };

        match &msg.event {
            SessionEvent::Connected => {
                debug!(pool = %self.endpoint, session = %msg.session, "Transport connected");
            }
            SessionEvent::LoginSuccess => {
                self.logged_in = true;
                if !self.active {
                    self.active = true;
                    if !self.options.quiet {
                        info!(pool = %self.endpoint, "Logged in");
                    }
                    listener.on_active(self.kind, session);
                }
            }
            SessionEvent::Job { job, raw } => {
                if self.active {
                    relay_job(self.kind, session, job, raw, listener);
                }
            }
            SessionEvent::ResultAccepted { result, error } => {
                listener.on_result_accepted(self.kind, session, result, error.as_deref());
            }
            SessionEvent::Disconnected { failures } => {
                if self.active {
                    self.active = false;
                    listener.on_pause(self.kind);
                }

                if !self.logged_in {
                    listener.on_connect_failed(self.kind, &self.endpoint, *failures);
                }

                if !self.options.quiet {
                    warn!(
                        pool = %self.endpoint,
                        failures,
                        retry_in_secs = self.options.retry_pause.as_secs(),
                        "Pool connection lost"
                    );
                }
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
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{Call, MockFactory, RecordingListener, test_result};
    use std::time::Duration;

    fn setup() -> (Arc<MockFactory>, SinglePoolStrategy, RecordingListener) {
        let factory = MockFactory::new();
        let strategy = SinglePoolStrategy::new(
            StrategyKind::Primary,
            Endpoint::new("pool", 3333),
            FailoverOptions {
                retries: 5,
                retry_pause: Duration::from_secs(5),
                quiet: false,
            },
            factory.clone(),
        );
        (factory, strategy, RecordingListener::new())
    }

    #[tokio::test]
    async fn login_activates_once_and_relays_jobs() {
        let (factory, mut strategy, mut listener) = setup();
        let now = Instant::now();

        strategy.connect(now, &mut listener);
        let id = factory.last();
        assert_eq!(factory.state(id).lock().connects.len(), 1);

        strategy.handle_message(&factory.login(id), now, &mut listener);
        strategy.handle_message(&factory.login(id), now, &mut listener);
        strategy.handle_message(&factory.job(id, "j1", "rx/0"), now, &mut listener);

        assert_eq!(
            listener.take(),
            vec![
                Call::Active(StrategyKind::Primary, id),
                Call::Job(StrategyKind::Primary, id, "j1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn disconnect_pauses_and_session_keeps_retrying() {
        let (factory, mut strategy, mut listener) = setup();
        let now = Instant::now();

        strategy.connect(now, &mut listener);
        let id = factory.last();
        strategy.handle_message(&factory.login(id), now, &mut listener);
        listener.take();

        strategy.handle_message(&factory.drop_connection(id, 1), now, &mut listener);
        assert_eq!(listener.take(), vec![Call::Pause(StrategyKind::Primary)]);
        assert!(!strategy.is_active());

        // No replacement; the same session reconnects itself
        assert_eq!(factory.count(), 1);
        assert_eq!(factory.state(id).lock().disconnects, 0);

        strategy.handle_message(&factory.login(id), now, &mut listener);
        assert_eq!(listener.take(), vec![Call::Active(StrategyKind::Primary, id)]);
    }

    #[tokio::test]
    async fn failure_before_login_reports_connect_failed() {
        let (factory, mut strategy, mut listener) = setup();
        let now = Instant::now();

        strategy.connect(now, &mut listener);
        let id = factory.last();
        strategy.handle_message(&factory.drop_connection(id, 1), now, &mut listener);

        assert_eq!(
            listener.take(),
            vec![Call::ConnectFailed(
                StrategyKind::Primary,
                "pool:3333".into(),
                1
            )]
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_silences_the_session() {
        let (factory, mut strategy, mut listener) = setup();
        let now = Instant::now();

        strategy.connect(now, &mut listener);
        let id = factory.last();
        strategy.handle_message(&factory.login(id), now, &mut listener);
        listener.take();

        strategy.stop();
        strategy.stop();

        assert!(listener.take().is_empty());
        assert_eq!(factory.state(id).lock().disconnects, 1);
        assert!(strategy.submit(&test_result("j1")).is_err());

        // Late events from the stopped session are not ours anymore
        assert!(!strategy.handle_message(&factory.job(id, "late", "rx/0"), now, &mut listener));
        assert!(listener.take().is_empty());
    }

    #[tokio::test]
    async fn resume_replays_latest_job() {
        let (factory, mut strategy, mut listener) = setup();
        let now = Instant::now();

        strategy.connect(now, &mut listener);
        let id = factory.last();
        strategy.handle_message(&factory.login(id), now, &mut listener);
        strategy.handle_message(&factory.job(id, "j7", "rx/0"), now, &mut listener);
        listener.take();

        strategy.resume(&mut listener);
        assert_eq!(
            listener.take(),
            vec![Call::Job(StrategyKind::Primary, id, "j7".into())]
        );
    }

    #[tokio::test]
    async fn submit_goes_to_logged_in_session() {
        let (factory, mut strategy, mut listener) = setup();
        let now = Instant::now();

        strategy.connect(now, &mut listener);
        let id = factory.last();
        assert_eq!(
            strategy.submit(&test_result("j1")),
            Err(StrategyError::NotConnected)
        );

        strategy.handle_message(&factory.login(id), now, &mut listener);
        assert_eq!(strategy.submit(&test_result("j1")), Ok(1));
        assert_eq!(factory.state(id).lock().submits.len(), 1);
    }
}
