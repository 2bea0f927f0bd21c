//! Pool wire protocol.
//!
//! Pools speak newline-delimited JSON-RPC over TCP in one of two login
//! styles:
//!
//! - **Direct login**: a single `login` request carries credentials and
//!   the algorithm list. The reply holds a session id, the extensions the
//!   pool supports, and the first job. Later jobs arrive as `job`
//!   notifications, results go out as `submit`.
//! - **Subscribe/authorize**: classic `mining.subscribe` then
//!   `mining.authorize`, with work in `mining.notify` and share difficulty
//!   in `mining.set_difficulty`.
//!
//! # Architecture
//!
//! [`StratumSession`] implements the synchronous
//! [`Session`](crate::session::Session) interface that strategies drive.
//! Behind it, each connection attempt is an async client task that
//! reports back through the shared [`SessionMessage`] channel and takes
//! submissions over a per-attempt command channel.
//!
//! [`SessionMessage`]: crate::session::SessionMessage

mod client;
mod connection;
mod error;
mod messages;
mod session;

pub use error::{StratumError, StratumResult};
pub use session::{StratumSession, StratumSessionFactory};
