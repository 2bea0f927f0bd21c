//! [`Session`] implementation backed by a spawned client task.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::client::{ClientConfig, StratumClient};
use super::messages::ClientCommand;
use crate::endpoint::Endpoint;
use crate::error::StrategyError;
use crate::job::{Algorithm, Job, JobResult, LoginParams};
use crate::session::{Extension, Session, SessionFactory, SessionId, SessionMessage};
use crate::timer::Timer;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const COMMAND_CAPACITY: usize = 32;

/// Connection state written by the client task and read by the session.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    pub connected: bool,
    pub connecting: bool,
    /// Consecutive failures since the last login success
    pub failures: u32,
    /// Earliest time the session may reconnect after a failure
    pub retry_at: Option<Instant>,
    pub extensions: HashSet<Extension>,
    pub job: Option<(Job, Value)>,
}

/// The running client task for one connection attempt.
struct Attempt {
    cancel: CancellationToken,
    commands: mpsc::Sender<ClientCommand>,
}

/// A pool connection driven by strategies.
///
/// Each connect spawns a [`StratumClient`] on a child of the factory's
/// shutdown token. Disconnecting or dropping the session cancels it.
pub struct StratumSession {
    id: SessionId,
    endpoint: Endpoint,
    agent: String,
    algorithms: Vec<Algorithm>,
    algorithm: Option<Algorithm>,
    login: Option<LoginParams>,
    quiet: bool,
    retry_pause: Duration,
    event_tx: mpsc::Sender<SessionMessage>,
    parent: CancellationToken,
    shared: Arc<Mutex<SharedState>>,
    attempt: Option<Attempt>,
    /// Set by `connect`, cleared by `disconnect`
    wanted: bool,
    next_submit: u64,
    keepalive: Timer,
}

impl StratumSession {
    fn spawn_client(&mut self) {
        if let Some(old) = self.attempt.take() {
            old.cancel.cancel();
        }

        {
            let mut shared = self.shared.lock();
            shared.connected = false;
            shared.connecting = true;
            shared.retry_at = None;
            shared.extensions.clear();
            shared.job = None;
        }
        self.keepalive.stop();

        let cancel = self.parent.child_token();
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);

        let config = ClientConfig {
            endpoint: self.endpoint.clone(),
            agent: self.agent.clone(),
            algorithms: self.algorithms.clone(),
            algorithm: self.algorithm.clone(),
            login: self.login.clone(),
            retry_pause: self.retry_pause,
            quiet: self.quiet,
        };

        let client = StratumClient::new(
            config,
            self.id,
            self.event_tx.clone(),
            command_rx,
            cancel.clone(),
            self.shared.clone(),
        );
        tokio::spawn(client.run());

        self.attempt = Some(Attempt { cancel, commands });
    }
}

impl Session for StratumSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn connect(&mut self, login: Option<LoginParams>) {
        debug!(session = %self.id, pool = %self.endpoint, "Connecting");
        self.login = login;
        self.wanted = true;
        self.spawn_client();
    }

    fn disconnect(&mut self) {
        self.wanted = false;
        if let Some(attempt) = self.attempt.take() {
            trace!(session = %self.id, pool = %self.endpoint, "Disconnecting");
            attempt.cancel.cancel();
        }

        let mut shared = self.shared.lock();
        shared.connected = false;
        shared.connecting = false;
        shared.retry_at = None;
        drop(shared);

        self.keepalive.stop();
    }

    fn submit(&mut self, result: &JobResult) -> Result<u64, StrategyError> {
        if !self.shared.lock().connected {
            return Err(StrategyError::NotConnected);
        }
        let attempt = self.attempt.as_ref().ok_or(StrategyError::NotConnected)?;

        let id = self.next_submit;
        attempt
            .commands
            .try_send(ClientCommand::Submit {
                id,
                result: result.clone(),
            })
            .map_err(|e| StrategyError::SubmissionFailure(e.to_string()))?;

        self.next_submit += 1;
        Ok(id)
    }

    fn tick(&mut self, now: Instant) {
        let (connected, reconnect, keepalive) = {
            let shared = self.shared.lock();
            let reconnect = self.wanted
                && !shared.connected
                && !shared.connecting
                && shared.retry_at.is_some_and(|at| now >= at);
            let keepalive = shared.extensions.contains(&Extension::Keepalive);
            (shared.connected, reconnect, keepalive)
        };

        if reconnect {
            debug!(session = %self.id, pool = %self.endpoint, "Reconnecting");
            self.spawn_client();
            return;
        }

        if !(connected && keepalive) {
            self.keepalive.stop();
            return;
        }

        if !self.keepalive.is_pending() {
            self.keepalive
                .start(now, KEEPALIVE_INTERVAL, Some(KEEPALIVE_INTERVAL));
        } else if self.keepalive.poll(now)
            && let Some(attempt) = &self.attempt
            && attempt.commands.try_send(ClientCommand::KeepAlive).is_err()
        {
            trace!(session = %self.id, "Keepalive skipped, command queue full");
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    fn is_secure(&self) -> bool {
        // Plain TCP only; TLS endpoints fail at connect
        false
    }

    fn supports_extension(&self, extension: Extension) -> bool {
        self.shared.lock().extensions.contains(&extension)
    }

    fn set_algorithm(&mut self, algorithm: Option<Algorithm>) {
        self.algorithm = algorithm;
    }

    fn set_quiet(&mut self, quiet: bool) {
        self.quiet = quiet;
    }

    fn set_retry_pause(&mut self, pause: Duration) {
        self.retry_pause = pause;
    }

    fn job(&self) -> Option<(Job, Value)> {
        self.shared.lock().job.clone()
    }
}

impl Drop for StratumSession {
    fn drop(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.cancel.cancel();
        }
    }
}

/// Creates [`StratumSession`]s that all report into one event channel.
pub struct StratumSessionFactory {
    event_tx: mpsc::Sender<SessionMessage>,
    agent: String,
    algorithms: Vec<Algorithm>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

impl StratumSessionFactory {
    pub fn new(
        event_tx: mpsc::Sender<SessionMessage>,
        agent: impl Into<String>,
        algorithms: Vec<Algorithm>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            event_tx,
            agent: agent.into(),
            algorithms,
            shutdown,
            next_id: AtomicU64::new(1),
        }
    }
}

impl SessionFactory for StratumSessionFactory {
    fn create(&self, endpoint: &Endpoint) -> Box<dyn Session> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        trace!(session = %id, pool = %endpoint, "Creating session");

        Box::new(StratumSession {
            id,
            endpoint: endpoint.clone(),
            agent: self.agent.clone(),
            algorithms: self.algorithms.clone(),
            algorithm: None,
            login: None,
            quiet: false,
            retry_pause: Duration::from_secs(5),
            event_tx: self.event_tx.clone(),
            parent: self.shutdown.clone(),
            shared: Arc::new(Mutex::new(SharedState::default())),
            attempt: None,
            wanted: false,
            next_submit: 0,
            keepalive: Timer::new(),
        })
    }
}
