//! Test doubles for strategy tests.
//!
//! [`MockFactory`] hands out [`MockSession`]s whose state stays reachable
//! from the test through the factory, so a test can inspect what a strategy
//! asked of a session and fabricate the events the session would report.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::Instant;

use super::{Extension, Session, SessionEvent, SessionFactory, SessionId, SessionMessage};
use crate::endpoint::Endpoint;
use crate::error::StrategyError;
use crate::job::{Algorithm, Job, JobResult, LoginParams, SubmitResult};
use crate::strategy::{StrategyKind, StrategyListener};

/// Everything a strategy did to one mock session.
#[derive(Debug, Default)]
pub struct MockState {
    pub connected: bool,
    pub secure: bool,
    pub extensions: HashSet<Extension>,
    pub connects: Vec<Option<LoginParams>>,
    pub disconnects: u32,
    pub submits: Vec<JobResult>,
    pub ticks: u32,
    pub algorithm: Option<Algorithm>,
    pub quiet: bool,
    pub retry_pause: Option<Duration>,
    pub job: Option<(Job, Value)>,
}

pub struct MockSession {
    id: SessionId,
    endpoint: Endpoint,
    state: Arc<Mutex<MockState>>,
}

impl Session for MockSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn connect(&mut self, login: Option<LoginParams>) {
        self.state.lock().connects.push(login);
    }

    fn disconnect(&mut self) {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.connected = false;
    }

    fn submit(&mut self, result: &JobResult) -> Result<u64, StrategyError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(StrategyError::NotConnected);
        }
        state.submits.push(result.clone());
        Ok(state.submits.len() as u64)
    }

    fn tick(&mut self, _now: Instant) {
        self.state.lock().ticks += 1;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn is_secure(&self) -> bool {
        self.state.lock().secure
    }

    fn supports_extension(&self, extension: Extension) -> bool {
        self.state.lock().extensions.contains(&extension)
    }

    fn set_algorithm(&mut self, algorithm: Option<Algorithm>) {
        self.state.lock().algorithm = algorithm;
    }

    fn set_quiet(&mut self, quiet: bool) {
        self.state.lock().quiet = quiet;
    }

    fn set_retry_pause(&mut self, pause: Duration) {
        self.state.lock().retry_pause = Some(pause);
    }

    fn job(&self) -> Option<(Job, Value)> {
        self.state.lock().job.clone()
    }
}

/// Factory that remembers every session it created.
#[derive(Default)]
pub struct MockFactory {
    sessions: Mutex<Vec<(SessionId, Endpoint, Arc<Mutex<MockState>>)>>,
    /// Extensions every new session starts with
    extensions: Mutex<HashSet<Extension>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sessions created from now on advertise `extension`.
    pub fn advertise(&self, extension: Extension) {
        self.extensions.lock().insert(extension);
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Id of the most recently created session.
    pub fn last(&self) -> SessionId {
        self.sessions
            .lock()
            .last()
            .map(|(id, _, _)| *id)
            .expect("no session created")
    }

    pub fn endpoint(&self, id: SessionId) -> Endpoint {
        self.find(id, |endpoint, _| endpoint.clone())
    }

    pub fn state(&self, id: SessionId) -> Arc<Mutex<MockState>> {
        self.find(id, |_, state| state.clone())
    }

    fn find<T>(&self, id: SessionId, f: impl FnOnce(&Endpoint, &Arc<Mutex<MockState>>) -> T) -> T {
        let sessions = self.sessions.lock();
        let (_, endpoint, state) = sessions
            .iter()
            .find(|(sid, _, _)| *sid == id)
            .expect("unknown session");
        f(endpoint, state)
    }

    /// Mark the session logged in and build the matching event.
    pub fn login(&self, id: SessionId) -> SessionMessage {
        let state = self.state(id);
        let mut state = state.lock();
        state.connected = true;
        SessionMessage::new(id, SessionEvent::LoginSuccess)
    }

    /// Mark the session dropped and build the matching event.
    pub fn drop_connection(&self, id: SessionId, failures: u32) -> SessionMessage {
        self.state(id).lock().connected = false;
        SessionMessage::new(id, SessionEvent::Disconnected { failures })
    }

    /// Store a job on the session and build the matching event.
    pub fn job(&self, id: SessionId, job_id: &str, algorithm: &str) -> SessionMessage {
        let job = test_job(job_id, algorithm);
        let raw = json!({"job_id": job_id, "algo": algorithm});
        self.state(id).lock().job = Some((job.clone(), raw.clone()));
        SessionMessage::new(id, SessionEvent::Job { job, raw })
    }
}

impl SessionFactory for MockFactory {
    fn create(&self, endpoint: &Endpoint) -> Box<dyn Session> {
        let mut sessions = self.sessions.lock();
        let id = SessionId(sessions.len() as u64 + 1);
        let state = Arc::new(Mutex::new(MockState {
            extensions: self.extensions.lock().clone(),
            ..Default::default()
        }));
        sessions.push((id, endpoint.clone(), state.clone()));

        Box::new(MockSession {
            id,
            endpoint: endpoint.clone(),
            state,
        })
    }
}

pub fn test_job(id: &str, algorithm: &str) -> Job {
    Job {
        id: id.to_string(),
        algorithm: Algorithm::new(algorithm),
        diff: 1000,
        height: 100,
        seed_hash: vec![0x11; 32],
        blob: vec![0; 76],
    }
}

pub fn test_result(job_id: &str) -> JobResult {
    JobResult {
        job_id: job_id.to_string(),
        nonce: 7,
        result: [0; 32],
        algorithm: None,
    }
}

/// One listener notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Active(StrategyKind, SessionId),
    Pause(StrategyKind),
    Job(StrategyKind, SessionId, String),
    Result(StrategyKind, SessionId, u64, Option<String>),
    ConnectFailed(StrategyKind, String, u32),
}

/// Listener that records notifications in order.
#[derive(Default)]
pub struct RecordingListener {
    pub calls: Vec<Call>,
    /// Algorithms `on_verify_algorithm` rejects
    pub rejected: Vec<Algorithm>,
    /// Returned from `login_params`
    pub login: Option<LoginParams>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self) -> Vec<Call> {
        std::mem::take(&mut self.calls)
    }

    pub fn activations(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Active(..)))
            .count()
    }
}

impl StrategyListener for RecordingListener {
    fn on_active(&mut self, kind: StrategyKind, session: &dyn Session) {
        self.calls.push(Call::Active(kind, session.id()));
    }

    fn on_pause(&mut self, kind: StrategyKind) {
        self.calls.push(Call::Pause(kind));
    }

    fn on_job(&mut self, kind: StrategyKind, session: &dyn Session, job: &Job, _raw: &Value) {
        self.calls.push(Call::Job(kind, session.id(), job.id.clone()));
    }

    fn on_result_accepted(
        &mut self,
        kind: StrategyKind,
        session: &dyn Session,
        result: &SubmitResult,
        error: Option<&str>,
    ) {
        self.calls.push(Call::Result(
            kind,
            session.id(),
            result.id,
            error.map(str::to_string),
        ));
    }

    fn on_verify_algorithm(
        &mut self,
        _kind: StrategyKind,
        _session: &dyn Session,
        algorithm: &Algorithm,
    ) -> bool {
        !self.rejected.contains(algorithm)
    }

    fn login_params(&mut self, _kind: StrategyKind, _endpoint: &Endpoint) -> Option<LoginParams> {
        self.login.clone()
    }

    fn on_connect_failed(&mut self, kind: StrategyKind, endpoint: &Endpoint, failures: u32) {
        self.calls
            .push(Call::ConnectFailed(kind, endpoint.address(), failures));
    }
}
