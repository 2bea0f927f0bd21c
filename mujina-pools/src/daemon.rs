//! Daemon lifecycle for mujina-pools.
//!
//! Loads configuration, starts the pool manager and the job consumer, then
//! waits for a termination signal and shuts everything down in order.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::PoolsConfig;
use crate::manager::{PoolEvent, PoolManager, WorkResult};
use crate::session::SessionMessage;
use crate::stratum::StratumSessionFactory;
use crate::tracing::prelude::*;

/// Top-level process state.
pub struct Daemon {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = PoolsConfig::from_env().context("invalid pool configuration")?;

        let (message_tx, message_rx) = mpsc::channel::<SessionMessage>(256);
        let (event_tx, mut event_rx) = mpsc::channel::<PoolEvent>(64);
        let (_result_tx, result_rx) = mpsc::channel::<WorkResult>(64);

        let factory = Arc::new(StratumSessionFactory::new(
            message_tx,
            config.agent.clone(),
            config.algorithms.clone(),
            self.shutdown.clone(),
        ));

        let manager = PoolManager::new(&config, factory, tokio::time::Instant::now())
            .context("failed to set up pool strategies")?;

        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            async move {
                if let Err(e) = manager
                    .run(message_rx, result_rx, event_tx, shutdown.clone())
                    .await
                {
                    error!(error = %e, "Pool manager failed");
                    shutdown.cancel();
                }
            }
        });

        // Job consumer. Hashing backends are outside this crate; work is
        // announced here and results would come back through `_result_tx`.
        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            async move {
                loop {
                    tokio::select! {
                        event = event_rx.recv() => match event {
                            Some(PoolEvent::Job { job, auxiliary, .. }) => {
                                debug!(job_id = %job.id, algo = %job.algorithm, auxiliary, "Work available");
                            }
                            Some(PoolEvent::Paused) => debug!("Work paused"),
                            Some(PoolEvent::ResultAccepted { .. }) => {}
                            None => break,
                        },
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        });
        self.tracker.close();

        info!(
            pools = config.endpoints.len(),
            auxiliary = config.auxiliary.is_some(),
            "Started."
        );

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            },
            _ = self.shutdown.cancelled() => {
                warn!("Shutting down after internal failure");
            },
        }

        trace!("Shutting down.");
        self.shutdown.cancel();

        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}
