//! Pool connection task.
//!
//! A [`StratumClient`] owns one connection attempt. It connects, performs
//! the handshake the endpoint's [`LoginMode`] calls for, then relays jobs
//! and submit verdicts as [`SessionMessage`]s until the connection ends.
//! The owning [`StratumSession`](super::StratumSession) spawns a new client
//! for every attempt and shares connection state with it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connection::{Connection, Transport};
use super::error::{StratumError, StratumResult};
use super::messages::{ClientCommand, JsonRpcMessage, error_reason};
use super::session::SharedState;
use crate::endpoint::{Endpoint, LoginMode};
use crate::error::StrategyError;
use crate::job::{Algorithm, Job, JobResult, LoginParams, SubmitResult};
use crate::session::{Extension, SessionEvent, SessionId, SessionMessage};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a client needs to know about the attempt it runs.
#[derive(Debug, Clone)]
pub(crate) struct ClientConfig {
    pub endpoint: Endpoint,
    pub agent: String,
    /// Algorithms this process can mine, in preference order
    pub algorithms: Vec<Algorithm>,
    /// Algorithm pinned by the owning strategy, if any
    pub algorithm: Option<Algorithm>,
    /// Extra fields merged into the `login` request
    pub login: Option<LoginParams>,
    pub retry_pause: Duration,
    pub quiet: bool,
}

/// Per-connection protocol state.
#[derive(Debug, Default)]
struct ProtocolState {
    /// Session id handed out by a direct-login pool
    rpc_id: Option<String>,

    /// Share difficulty from `mining.set_difficulty`
    difficulty: Option<u64>,

    logged_in: bool,
}

/// Drives one connection attempt to a pool.
pub(crate) struct StratumClient {
    config: ClientConfig,
    session: SessionId,
    event_tx: mpsc::Sender<SessionMessage>,
    command_rx: mpsc::Receiver<ClientCommand>,
    shutdown: CancellationToken,
    shared: Arc<Mutex<SharedState>>,
    next_id: u64,
    state: ProtocolState,
}

impl StratumClient {
    pub fn new(
        config: ClientConfig,
        session: SessionId,
        event_tx: mpsc::Sender<SessionMessage>,
        command_rx: mpsc::Receiver<ClientCommand>,
        shutdown: CancellationToken,
        shared: Arc<Mutex<SharedState>>,
    ) -> Self {
        Self {
            config,
            session,
            event_tx,
            command_rx,
            shutdown,
            shared,
            next_id: 1,
            state: ProtocolState::default(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn emit(&self, event: SessionEvent) -> StratumResult<()> {
        self.event_tx
            .send(SessionMessage::new(self.session, event))
            .await
            .map_err(|_| StratumError::Disconnected)
    }

    /// Send a request and wait for its response.
    ///
    /// Notifications that arrive in the meantime are handled inline, so a
    /// job pushed while a submit is in flight is not lost.
    async fn send_request(
        &mut self,
        conn: &mut dyn Transport,
        method: &str,
        params: Value,
        timeout_dur: Duration,
    ) -> StratumResult<JsonRpcMessage> {
        use tokio::time::timeout;

        let id = self.next_id();

        let msg = JsonRpcMessage::request(id, method, params);
        conn.write_message(&msg).await?;

        timeout(timeout_dur, async {
            loop {
                tokio::select! {
                    result = conn.read_message() => {
                        let msg = result?.ok_or(StratumError::Disconnected)?;

                        match msg {
                            JsonRpcMessage::Response { id: resp_id, .. } if resp_id == id => {
                                return Ok(msg);
                            }
                            JsonRpcMessage::Response { id: other_id, .. } => {
                                warn!(msg_id = other_id, "Received response for different request");
                            }
                            JsonRpcMessage::Request {
                                id: None,
                                method,
                                params,
                            } => {
                                if let Err(e) = self.handle_notification(&method, &params).await {
                                    if matches!(e, StratumError::Disconnected) {
                                        return Err(e);
                                    }
                                    warn!(error = %e, "Error handling notification");
                                }
                            }
                            JsonRpcMessage::Request {
                                id: Some(_),
                                method,
                                ..
                            } => {
                                warn!(method = %method, "Server sent request while awaiting response");
                            }
                        }
                    }

                    _ = self.shutdown.cancelled() => {
                        return Err(StratumError::Disconnected);
                    }
                }
            }
        })
        .await
        .map_err(|_| StratumError::Timeout)?
    }

    /// Direct login: one request carries credentials and the algorithm
    /// list, the response carries the session id and first job.
    async fn login(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        let endpoint = &self.config.endpoint;

        let mut algo = self.config.algorithms.clone();
        if let Some(pinned) = self.config.algorithm.as_ref().or(endpoint.algorithm()) {
            algo.retain(|a| a != pinned);
            algo.insert(0, pinned.clone());
        }

        let mut params = serde_json::Map::new();
        params.insert("login".into(), json!(endpoint.login_user()));
        params.insert("pass".into(), json!(endpoint.password()));
        params.insert("agent".into(), json!(self.config.agent));
        if let Some(rig_id) = endpoint.rig_id() {
            params.insert("rigid".into(), json!(rig_id));
        }
        params.insert("algo".into(), json!(algo));
        if let Some(extra) = &self.config.login {
            params.extend(extra.to_json());
        }

        let response = self
            .send_request(conn, "login", Value::Object(params), RESPONSE_TIMEOUT)
            .await?;

        let result = match response {
            JsonRpcMessage::Response {
                result: Some(result),
                error: None,
                ..
            } => result,
            JsonRpcMessage::Response {
                error: Some(error), ..
            } => return Err(StratumError::AuthorizationFailed(error_reason(&error))),
            _ => {
                return Err(StratumError::UnexpectedResponse(
                    "Invalid login response".to_string(),
                ));
            }
        };

        let rpc_id = result
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| StratumError::MissingField("id".to_string()))?;
        self.state.rpc_id = Some(rpc_id.to_string());

        let extensions: HashSet<Extension> = result
            .get("extensions")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .filter_map(Extension::from_wire)
                    .collect()
            })
            .unwrap_or_default();

        self.logged_in(extensions).await?;

        if let Some(job) = result.get("job") {
            self.handle_login_job(job).await?;
        }

        Ok(())
    }

    /// Subscribe to mining notifications.
    async fn subscribe(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        let agent = self.config.agent.clone();
        let response = self
            .send_request(conn, "mining.subscribe", json!([agent]), RESPONSE_TIMEOUT)
            .await?;

        match response {
            JsonRpcMessage::Response {
                result: Some(_),
                error: None,
                ..
            } => Ok(()),
            JsonRpcMessage::Response {
                error: Some(error), ..
            } => Err(StratumError::SubscriptionFailed(error_reason(&error))),
            _ => Err(StratumError::UnexpectedResponse(
                "Invalid subscribe response".to_string(),
            )),
        }
    }

    /// Authorize the worker.
    async fn authorize(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        let user = self.config.endpoint.login_user().to_string();
        let password = self.config.endpoint.password().to_string();

        let response = self
            .send_request(
                conn,
                "mining.authorize",
                json!([user, password]),
                RESPONSE_TIMEOUT,
            )
            .await?;

        match response {
            JsonRpcMessage::Response {
                result: Some(result),
                error: None,
                ..
            } => {
                if result.as_bool().unwrap_or(false) {
                    Ok(())
                } else {
                    Err(StratumError::AuthorizationFailed(
                        "Pool returned false".to_string(),
                    ))
                }
            }
            JsonRpcMessage::Response {
                error: Some(error), ..
            } => Err(StratumError::AuthorizationFailed(error_reason(&error))),
            _ => Err(StratumError::UnexpectedResponse(
                "Invalid authorize response".to_string(),
            )),
        }
    }

    /// Record a successful login and publish it.
    ///
    /// A job that arrived during the handshake is replayed after
    /// `LoginSuccess` so strategies see them in that order.
    async fn logged_in(&mut self, extensions: HashSet<Extension>) -> StratumResult<()> {
        let held = {
            let mut shared = self.shared.lock();
            shared.connected = true;
            shared.connecting = false;
            shared.failures = 0;
            shared.retry_at = None;
            shared.extensions = extensions;
            shared.job.clone()
        };
        self.state.logged_in = true;

        if self.config.quiet {
            debug!(pool = %self.config.endpoint, "Logged in");
        } else {
            info!(pool = %self.config.endpoint, "Logged in");
        }

        self.emit(SessionEvent::LoginSuccess).await?;

        if let Some((job, raw)) = held {
            self.emit(SessionEvent::Job { job, raw }).await?;
        }
        Ok(())
    }

    /// Submit a result and report the verdict.
    async fn submit(
        &mut self,
        conn: &mut dyn Transport,
        id: u64,
        result: &JobResult,
    ) -> StratumResult<()> {
        let params = match self.config.endpoint.mode() {
            LoginMode::Login => {
                let rpc_id = self
                    .state
                    .rpc_id
                    .as_deref()
                    .ok_or(StratumError::Disconnected)?;
                result.to_login_json(rpc_id)
            }
            LoginMode::SubscribeAuthorize => json!([
                self.config.endpoint.login_user(),
                result.job_id,
                hex::encode(result.nonce.to_le_bytes()),
                hex::encode(result.result),
            ]),
        };

        let method = match self.config.endpoint.mode() {
            LoginMode::Login => "submit",
            LoginMode::SubscribeAuthorize => "mining.submit",
        };

        let started = Instant::now();
        let response = self
            .send_request(conn, method, params, RESPONSE_TIMEOUT)
            .await?;
        let elapsed = started.elapsed();

        let error = match response {
            JsonRpcMessage::Response {
                error: Some(error), ..
            } => Some(error_reason(&error)),
            JsonRpcMessage::Response {
                result: Some(Value::Bool(false)),
                ..
            } => Some("Pool returned false".to_string()),
            JsonRpcMessage::Response {
                result: Some(_), ..
            } => None,
            _ => {
                return Err(StratumError::UnexpectedResponse(
                    "Invalid submit response".to_string(),
                ));
            }
        };

        let submit = SubmitResult {
            id,
            job_id: result.job_id.clone(),
            elapsed,
        };
        self.emit(SessionEvent::ResultAccepted {
            result: submit,
            error,
        })
        .await
    }

    /// Keep a direct-login connection alive.
    async fn keepalive(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        let Some(rpc_id) = self.state.rpc_id.clone() else {
            return Ok(());
        };

        self.send_request(conn, "keepalived", json!({ "id": rpc_id }), RESPONSE_TIMEOUT)
            .await?;
        trace!(pool = %self.config.endpoint, "Keepalive acknowledged");
        Ok(())
    }

    /// Handle a notification from the pool.
    async fn handle_notification(&mut self, method: &str, params: &Value) -> StratumResult<()> {
        match method {
            "job" => self.handle_login_job(params).await?,
            "mining.notify" => self.handle_mining_notify(params).await?,
            "mining.set_difficulty" => self.handle_set_difficulty(params)?,
            "client.reconnect" => {
                return Err(StratumError::Disconnected);
            }
            _ => {
                warn!(method = %method, "Unknown notification method");
            }
        }
        Ok(())
    }

    async fn handle_login_job(&mut self, params: &Value) -> StratumResult<()> {
        let fallback = self
            .config
            .algorithm
            .as_ref()
            .or(self.config.endpoint.algorithm())
            .or(self.config.algorithms.first());

        let job = Job::from_login_json(params, fallback).map_err(StratumError::InvalidMessage)?;
        self.publish_job(job, params.clone()).await
    }

    async fn handle_mining_notify(&mut self, params: &Value) -> StratumResult<()> {
        let id = params
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(Value::as_str)
            .ok_or_else(|| StratumError::InvalidMessage("mining.notify without job id".into()))?;

        let algorithm = self
            .config
            .algorithm
            .clone()
            .or_else(|| self.config.endpoint.algorithm().cloned())
            .unwrap_or_else(|| Algorithm::new("sha256d"));

        let job = Job {
            id: id.to_string(),
            algorithm,
            diff: self.state.difficulty.unwrap_or(1),
            height: 0,
            seed_hash: Vec::new(),
            blob: Vec::new(),
        };
        self.publish_job(job, params.clone()).await
    }

    fn handle_set_difficulty(&mut self, params: &Value) -> StratumResult<()> {
        let difficulty = params
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(Value::as_u64)
            .ok_or_else(|| StratumError::InvalidMessage("Invalid set_difficulty params".into()))?;

        trace!(difficulty, "Pool set difficulty");
        self.state.difficulty = Some(difficulty);
        Ok(())
    }

    /// Store the job and emit it, or hold it until login completes.
    async fn publish_job(&mut self, job: Job, raw: Value) -> StratumResult<()> {
        debug!(
            pool = %self.config.endpoint,
            job_id = %job.id,
            algo = %job.algorithm,
            diff = job.diff,
            "New job"
        );
        self.shared.lock().job = Some((job.clone(), raw.clone()));

        if self.state.logged_in {
            self.emit(SessionEvent::Job { job, raw }).await
        } else {
            trace!("Job held until login completes");
            Ok(())
        }
    }

    /// Run one connection attempt to completion.
    ///
    /// Reports `Disconnected` with the updated failure count when the
    /// attempt ends, unless it was cancelled by the owning session.
    pub async fn run(mut self) {
        let result = match self.open().await {
            Ok(conn) => match self.emit(SessionEvent::Connected).await {
                Ok(()) => self.serve(conn).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        if self.shutdown.is_cancelled() {
            trace!(session = %self.session, "Client cancelled");
            return;
        }

        let error = match result {
            Ok(()) => StratumError::Disconnected,
            Err(e) => e,
        };
        self.fail(error).await;
    }

    async fn open(&self) -> StratumResult<Connection> {
        let endpoint = &self.config.endpoint;
        if endpoint.is_tls() {
            return Err(StratumError::TlsUnsupported(endpoint.to_string()));
        }

        let address = endpoint.address();
        tokio::select! {
            result = tokio::time::timeout(CONNECT_TIMEOUT, Connection::connect(&address)) => {
                result.map_err(|_| StratumError::Timeout)?
            }
            _ = self.shutdown.cancelled() => Err(StratumError::Disconnected),
        }
    }

    async fn fail(self, error: StratumError) {
        let failures = {
            let mut shared = self.shared.lock();
            shared.connected = false;
            shared.connecting = false;
            shared.failures += 1;
            shared.retry_at = Some(Instant::now() + self.config.retry_pause);
            shared.failures
        };

        let endpoint = &self.config.endpoint;
        let error = StrategyError::from_stratum(&endpoint.to_string(), &error);
        if self.config.quiet {
            debug!(pool = %endpoint, failures, error = %error, "Pool connection lost");
        } else {
            warn!(
                pool = %endpoint,
                failures,
                retry_in_secs = self.config.retry_pause.as_secs(),
                error = %error,
                "Pool connection lost"
            );
        }

        let event = SessionEvent::Disconnected { failures };
        if self.emit(event).await.is_err() {
            trace!(session = %self.session, "Event receiver gone");
        }
    }

    /// Handshake, then relay notifications and commands until the
    /// connection ends or the attempt is cancelled.
    pub(crate) async fn serve(&mut self, mut conn: impl Transport) -> StratumResult<()> {
        match self.config.endpoint.mode() {
            LoginMode::Login => self.login(&mut conn).await?,
            LoginMode::SubscribeAuthorize => {
                self.subscribe(&mut conn).await?;
                self.authorize(&mut conn).await?;
                self.logged_in(HashSet::new()).await?;
            }
        }

        loop {
            tokio::select! {
                msg = conn.read_message() => {
                    match msg {
                        Ok(Some(JsonRpcMessage::Request { id: None, method, params })) => {
                            if let Err(e) = self.handle_notification(&method, &params).await {
                                if matches!(e, StratumError::Disconnected) {
                                    return Err(e);
                                }
                                warn!(error = %e, "Error handling notification");
                            }
                        }
                        Ok(Some(JsonRpcMessage::Response { id, .. })) => {
                            debug!(msg_id = %id, "Received unexpected response in main loop");
                        }
                        Ok(Some(JsonRpcMessage::Request { id: Some(_), method, .. })) => {
                            warn!(method = %method, "Server sent request (not notification)");
                        }
                        Ok(None) => {
                            info!(pool = %self.config.endpoint, "Connection closed by pool");
                            return Err(StratumError::Disconnected);
                        }
                        Err(StratumError::InvalidMessage(msg)) => {
                            warn!(error = %msg, "Received malformed message from pool, ignoring");
                        }
                        Err(e) => return Err(e),
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        ClientCommand::Submit { id, result } => {
                            debug!(pool = %self.config.endpoint, job_id = %result.job_id, "Submitting result");
                            if let Err(e) = self.submit(&mut conn, id, &result).await {
                                match e {
                                    StratumError::Disconnected
                                    | StratumError::Io(_)
                                    | StratumError::Timeout => return Err(e),
                                    other => {
                                        warn!(pool = %self.config.endpoint, error = %other, "Failed to submit result");
                                    }
                                }
                            }
                        }
                        ClientCommand::KeepAlive => self.keepalive(&mut conn).await?,
                    }
                }

                _ = self.shutdown.cancelled() => {
                    return Ok(());
                }
            }
        }
    }
}
