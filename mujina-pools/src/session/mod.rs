//! The session seam between strategies and the wire.
//!
//! A [`Session`] is one connection (live or pending) to one endpoint.
//! Strategies own sessions exclusively and drive them synchronously; the
//! I/O behind a session runs elsewhere and reports back through
//! [`SessionMessage`]s tagged with the session's [`SessionId`]. A strategy
//! drops any message whose id it no longer owns, which is how late events
//! from a replaced or stopped session are discarded.

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::endpoint::Endpoint;
use crate::error::StrategyError;
use crate::job::{Algorithm, Job, JobResult, LoginParams, SubmitResult};

/// Identifier assigned to each session by its factory. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Protocol extensions a pool may advertise at login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extension {
    /// Pool accepts an algorithm list and reports `algo` per job
    Algo,
    /// Nicehash-style fixed nonce bytes
    Nicehash,
    /// Pool can forward a second login to another URL (tunneling)
    Connect,
    /// Pool can reach the forward target over TLS
    Tls,
    /// Pool answers `keepalived`
    Keepalive,
}

impl Extension {
    /// Parse the wire name used in the login response.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "algo" => Some(Extension::Algo),
            "nicehash" => Some(Extension::Nicehash),
            "connect" => Some(Extension::Connect),
            "tls" => Some(Extension::Tls),
            "keepalive" => Some(Extension::Keepalive),
            _ => None,
        }
    }
}

/// Lifecycle events reported by a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Transport established, handshake not yet complete
    Connected,

    /// Pool accepted our credentials
    LoginSuccess,

    /// New job. `raw` is the job exactly as the pool sent it.
    Job { job: Job, raw: Value },

    /// Pool answered a submission. `error` holds the rejection reason.
    ResultAccepted {
        result: SubmitResult,
        error: Option<String>,
    },

    /// Connection lost or attempt failed. `failures` counts consecutive
    /// failures since the last login success.
    Disconnected { failures: u32 },
}

/// A session event tagged with its origin.
#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub session: SessionId,
    pub event: SessionEvent,
}

impl SessionMessage {
    pub fn new(session: SessionId, event: SessionEvent) -> Self {
        Self { session, event }
    }
}

/// Control interface of a pool connection.
///
/// All methods return immediately. Outcomes arrive later as
/// [`SessionMessage`]s.
pub trait Session: Send {
    fn id(&self) -> SessionId;

    fn endpoint(&self) -> &Endpoint;

    /// Start connecting. `login` is merged into the login request and
    /// reused for the session's own reconnect attempts.
    fn connect(&mut self, login: Option<LoginParams>);

    /// Close the connection and stop reconnecting.
    fn disconnect(&mut self);

    /// Send a result. Returns the submission id echoed in
    /// [`SessionEvent::ResultAccepted`].
    fn submit(&mut self, result: &JobResult) -> Result<u64, StrategyError>;

    /// Advance keepalive and reconnect timers.
    fn tick(&mut self, now: Instant);

    fn is_connected(&self) -> bool;

    /// Whether the established transport is encrypted.
    fn is_secure(&self) -> bool;

    fn supports_extension(&self, extension: Extension) -> bool;

    fn set_algorithm(&mut self, algorithm: Option<Algorithm>);

    /// Quiet sessions log at debug instead of info.
    fn set_quiet(&mut self, quiet: bool);

    /// Delay between a failure and the session's next reconnect attempt.
    fn set_retry_pause(&mut self, pause: Duration);

    /// Most recent job, if any.
    fn job(&self) -> Option<(Job, Value)>;
}

/// Creates sessions for strategies.
pub trait SessionFactory: Send + Sync {
    fn create(&self, endpoint: &Endpoint) -> Box<dyn Session>;
}
