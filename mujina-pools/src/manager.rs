//! Pool manager: the owner of the primary and auxiliary strategies.
//!
//! The manager is the only [`StrategyListener`] the outside world needs. It
//! decides which strategy's jobs reach the workers, routes each result back
//! to the strategy whose job produced it, and keeps the auxiliary strategy
//! informed about the primary (its latest job and whether it can tunnel).
//!
//! All strategy calls happen on the task that runs [`PoolManager::run`].
//! Outcomes collect in an outbox and are drained into the event channel
//! after every call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::PoolsConfig;
use crate::endpoint::Endpoint;
use crate::error::{ConfigError, StrategyError};
use crate::job::{Algorithm, Job, JobResult, SubmitResult};
use crate::session::{Session, SessionFactory, SessionMessage};
use crate::strategy::{
    AuxiliaryStrategy, FailoverOptions, PoolStrategy, PrimarySnapshot, Strategy, StrategyKind,
    StrategyListener,
};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Work handed to the workers, or a change in its availability.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// New job. `auxiliary` must be echoed in the [`WorkResult`].
    Job {
        job: Job,
        raw: Value,
        auxiliary: bool,
    },

    /// No strategy has work; stop hashing.
    Paused,

    /// A pool answered a submission.
    ResultAccepted {
        auxiliary: bool,
        result: SubmitResult,
        error: Option<String>,
    },
}

/// A solved job coming back from a worker.
#[derive(Debug, Clone)]
pub struct WorkResult {
    pub result: JobResult,

    /// Copied from the [`PoolEvent::Job`] the result was computed for
    pub auxiliary: bool,
}

/// Submission verdict counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub accepted: u64,
    pub rejected: u64,
    pub aux_accepted: u64,
    pub aux_rejected: u64,
}

/// Listener shared by both strategies.
struct Dispatch {
    algorithms: Vec<Algorithm>,
    primary_active: bool,
    aux_active: bool,
    /// Latest primary job not yet handed to the auxiliary strategy
    primary_job: Option<Job>,
    /// Set when the auxiliary strategy steps back under an active primary
    resume_primary: bool,
    stats: PoolStats,
    outbox: Vec<PoolEvent>,
}

impl Dispatch {
    fn new(algorithms: Vec<Algorithm>) -> Self {
        Self {
            algorithms,
            primary_active: false,
            aux_active: false,
            primary_job: None,
            resume_primary: false,
            stats: PoolStats::default(),
            outbox: Vec::new(),
        }
    }
}

impl StrategyListener for Dispatch {
    fn on_active(&mut self, kind: StrategyKind, session: &dyn Session) {
        match kind {
            StrategyKind::Primary => {
                self.primary_active = true;
                info!(pool = %session.endpoint(), "Pool active");
            }
            StrategyKind::Auxiliary => {
                self.aux_active = true;
                info!(pool = %session.endpoint(), "Switched to auxiliary pool");
            }
        }
    }

    fn on_pause(&mut self, kind: StrategyKind) {
        match kind {
            StrategyKind::Primary => {
                self.primary_active = false;
                if !self.aux_active {
                    warn!("No active pool, pausing work");
                    self.outbox.push(PoolEvent::Paused);
                }
            }
            StrategyKind::Auxiliary => {
                self.aux_active = false;
                if self.primary_active {
                    info!("Switching back to primary pool");
                    self.resume_primary = true;
                } else {
                    self.outbox.push(PoolEvent::Paused);
                }
            }
        }
    }

    fn on_job(&mut self, kind: StrategyKind, session: &dyn Session, job: &Job, raw: &Value) {
        let auxiliary = kind == StrategyKind::Auxiliary;

        if !auxiliary {
            self.primary_job = Some(job.clone());
            if self.aux_active {
                trace!(job_id = %job.id, "Primary job held while auxiliary pool is active");
                return;
            }
        }

        info!(
            pool = %session.endpoint(),
            job_id = %job.id,
            algo = %job.algorithm,
            diff = job.diff,
            height = job.height,
            "New job"
        );
        self.outbox.push(PoolEvent::Job {
            job: job.clone(),
            raw: raw.clone(),
            auxiliary,
        });
    }

    fn on_result_accepted(
        &mut self,
        kind: StrategyKind,
        session: &dyn Session,
        result: &SubmitResult,
        error: Option<&str>,
    ) {
        let auxiliary = kind == StrategyKind::Auxiliary;
        let (accepted, rejected) = if auxiliary {
            (&mut self.stats.aux_accepted, &mut self.stats.aux_rejected)
        } else {
            (&mut self.stats.accepted, &mut self.stats.rejected)
        };

        match error {
            None => {
                *accepted += 1;
                info!(
                    pool = %session.endpoint(),
                    accepted = *accepted,
                    rejected = *rejected,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "Result accepted"
                );
            }
            Some(reason) => {
                *rejected += 1;
                warn!(
                    pool = %session.endpoint(),
                    accepted = *accepted,
                    rejected = *rejected,
                    reason,
                    "Result rejected"
                );
            }
        }

        self.outbox.push(PoolEvent::ResultAccepted {
            auxiliary,
            result: result.clone(),
            error: error.map(str::to_string),
        });
    }

    fn on_verify_algorithm(
        &mut self,
        _kind: StrategyKind,
        _session: &dyn Session,
        algorithm: &Algorithm,
    ) -> bool {
        self.algorithms.contains(algorithm)
    }

    fn on_connect_failed(&mut self, kind: StrategyKind, endpoint: &Endpoint, failures: u32) {
        if kind == StrategyKind::Primary {
            warn!(
                pool = %endpoint,
                failures,
                "All pools unreachable, starting over"
            );
        }
    }
}

/// Owns the strategies and drives them from session messages, worker
/// results and time.
pub struct PoolManager {
    primary: PoolStrategy,
    auxiliary: Option<AuxiliaryStrategy>,
    dispatch: Dispatch,
}

impl PoolManager {
    pub fn new(
        config: &PoolsConfig,
        factory: Arc<dyn SessionFactory>,
        now: Instant,
    ) -> Result<Self, ConfigError> {
        let options = FailoverOptions {
            retries: config.retries,
            retry_pause: config.retry_pause,
            quiet: false,
        };
        let primary = PoolStrategy::new(
            StrategyKind::Primary,
            config.endpoints.clone(),
            options,
            factory.clone(),
        )?;

        let auxiliary = config
            .auxiliary
            .as_ref()
            .map(|aux| AuxiliaryStrategy::new(aux, config.algorithms.clone(), factory, now))
            .transpose()?;

        Ok(Self {
            primary,
            auxiliary,
            dispatch: Dispatch::new(config.algorithms.clone()),
        })
    }

    /// Connect the primary strategy. The auxiliary strategy starts on its
    /// own schedule.
    pub fn start(&mut self, now: Instant) {
        self.primary.connect(now, &mut self.dispatch);
        self.sync();
    }

    pub fn handle_message(&mut self, msg: &SessionMessage, now: Instant) {
        let handled = self.primary.handle_message(msg, now, &mut self.dispatch)
            || self
                .auxiliary
                .as_mut()
                .is_some_and(|aux| aux.handle_message(msg, now, &mut self.dispatch));

        if !handled {
            trace!(session = %msg.session, "Message from retired session dropped");
        }
        self.sync();
    }

    /// Send a result to the strategy that issued its job.
    pub fn submit(&mut self, work: &WorkResult) -> Result<u64, StrategyError> {
        match (&mut self.auxiliary, work.auxiliary) {
            (Some(aux), true) => aux.submit(&work.result),
            (None, true) => Err(StrategyError::NotConnected),
            (_, false) => self.primary.submit(&work.result),
        }
    }

    pub fn tick(&mut self, now: Instant) {
        self.primary.tick(now, &mut self.dispatch);
        self.sync();

        if let Some(aux) = self.auxiliary.as_mut() {
            aux.tick(now, &mut self.dispatch);
        }
        self.sync();
    }

    /// Pin or clear the algorithm on both strategies.
    pub fn set_algorithm(&mut self, algorithm: Option<Algorithm>) {
        self.primary.set_algorithm(algorithm.clone());
        if let Some(aux) = self.auxiliary.as_mut() {
            aux.set_algorithm(algorithm);
        }
    }

    pub fn stop(&mut self) {
        self.primary.stop();
        if let Some(aux) = self.auxiliary.as_mut() {
            aux.stop();
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.primary.next_deadline(),
            self.auxiliary.as_ref().and_then(|aux| aux.next_deadline()),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn stats(&self) -> PoolStats {
        self.dispatch.stats
    }

    pub fn auxiliary(&self) -> Option<&AuxiliaryStrategy> {
        self.auxiliary.as_ref()
    }

    /// Events produced since the last drain, in order.
    pub fn drain_events(&mut self) -> Vec<PoolEvent> {
        std::mem::take(&mut self.dispatch.outbox)
    }

    /// Carry primary state over to the auxiliary strategy and resume the
    /// primary if the auxiliary strategy just stepped back.
    fn sync(&mut self) {
        if let Some(aux) = self.auxiliary.as_mut() {
            if let Some(job) = self.dispatch.primary_job.take() {
                aux.update(&job);
            }
            aux.set_primary(self.primary.active_session().map(PrimarySnapshot::of));
        }

        if std::mem::take(&mut self.dispatch.resume_primary) {
            self.primary.resume(&mut self.dispatch);
        }
    }

    /// Send pending events. A closed receiver is only an error while the
    /// daemon is still running.
    async fn flush(
        &mut self,
        events: &mpsc::Sender<PoolEvent>,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<()> {
        for event in self.drain_events() {
            if events.send(event).await.is_err() {
                if shutdown.is_cancelled() {
                    debug!("Event receiver gone during shutdown");
                    return Ok(());
                }
                return Err(anyhow!("pool event receiver closed"));
            }
        }
        Ok(())
    }

    /// Drive the strategies until `shutdown` is cancelled.
    pub async fn run(
        mut self,
        mut messages: mpsc::Receiver<SessionMessage>,
        mut results: mpsc::Receiver<WorkResult>,
        events: mpsc::Sender<PoolEvent>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        self.start(Instant::now());
        self.flush(&events, &shutdown).await?;

        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                Some(msg) = messages.recv() => {
                    self.handle_message(&msg, Instant::now());
                }

                Some(work) = results.recv() => {
                    if let Err(e) = self.submit(&work) {
                        warn!(
                            job_id = %work.result.job_id,
                            auxiliary = work.auxiliary,
                            error = %e,
                            "Result dropped"
                        );
                    }
                }

                _ = interval.tick() => self.tick(Instant::now()),

                _ = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => self.tick(Instant::now()),

                _ = shutdown.cancelled() => break,
            }

            self.flush(&events, &shutdown).await?;
        }

        self.stop();
        let stats = self.stats();
        debug!(
            accepted = stats.accepted,
            rejected = stats.rejected,
            aux_accepted = stats.aux_accepted,
            aux_rejected = stats.aux_rejected,
            "Pool manager stopped"
        );
        Ok(())
    }
}
