//! Pool connection strategies for mujina.
//!
//! Decides which pool a miner talks to and when: a single pool, an ordered
//! failover list, and a periodic time-boxed auxiliary session that either
//! opens its own connection or tunnels through the primary pool.

pub mod config;
pub mod daemon;
pub mod endpoint;
pub mod error;
pub mod job;
pub mod manager;
pub mod session;
pub mod strategy;
pub mod stratum;
pub mod timer;
pub mod tracing;
