//! Pre-warm scheduler: keeps the pool of idle ready agents at its target.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use warmpool_core::instruments;

use super::OrchestrationError;
use super::spawner::{SpawnOrder, SpawnPool, SubmitOutcome};
use crate::storage::{Database, SessionConfig};

/// What one scheduler cycle saw and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrewarmReport {
    pub target: u32,
    pub pool_size: i64,
    /// Pool-bound spawns still in their handshake.
    pub pending: i64,
    pub submitted: u32,
}

/// Periodically tops the pool set up to the target size.
#[derive(Clone)]
pub struct PrewarmScheduler {
    db: Database,
    spawner: SpawnPool,
    default_target: u32,
    interval: Duration,
    nudge: Arc<Notify>,
}

impl PrewarmScheduler {
    pub fn new(db: Database, spawner: SpawnPool, default_target: u32, interval: Duration) -> Self {
        Self {
            db,
            spawner,
            default_target,
            interval,
            nudge: Arc::new(Notify::new()),
        }
    }

    /// Wakes the scheduler ahead of its next tick.
    pub fn nudger(&self) -> Arc<Notify> {
        Arc::clone(&self.nudge)
    }

    /// Target currently in force: the stored operator value, else the default.
    pub async fn target(&self) -> Result<u32, OrchestrationError> {
        Ok(self.db.pool_target().await?.unwrap_or(self.default_target))
    }

    /// Submit one pool-bound spawn per missing member.
    pub async fn run_cycle(&self) -> Result<PrewarmReport, OrchestrationError> {
        let target = self.target().await?;
        let pool_size = self.db.pool_size().await?;
        instruments::record_pool_size(pool_size);
        let pending = self.db.count_pending_pool_spawns().await?;

        let deficit = i64::from(target) - pool_size - pending;
        let mut report = PrewarmReport {
            target,
            pool_size,
            pending,
            submitted: 0,
        };
        if deficit <= 0 {
            debug!(target, pool_size, pending, "Pool at target");
            return Ok(report);
        }

        for _ in 0..deficit {
            let order = SpawnOrder {
                session_id: uuid::Uuid::new_v4().to_string(),
                config: SessionConfig::default(),
                pool_bound: true,
                caller_ref: None,
            };
            match self.spawner.submit(order).await {
                Ok(SubmitOutcome::Accepted(_)) => report.submitted += 1,
                Ok(SubmitOutcome::Duplicate(session)) => {
                    warn!(session_id = %session.id, "Fresh pool id collided with an existing session");
                }
                Err(e) => warn!(error = %e, "Failed to submit pre-warm spawn"),
            }
        }

        info!(
            target,
            pool_size,
            pending,
            submitted = report.submitted,
            "Pre-warm cycle submitted spawns"
        );
        Ok(report)
    }

    /// Run cycles on the interval (and on every nudge) until shutdown.
    pub fn spawn(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(interval_secs = self.interval.as_secs(), "Pre-warm scheduler started");
            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    () = self.nudge.notified() => {}
                    _ = shutdown.changed() => {
                        info!("Pre-warm scheduler shutting down");
                        return;
                    }
                }
                if let Err(e) = self.run_cycle().await {
                    warn!(error = %e, "Pre-warm cycle failed");
                }
            }
        })
    }
}
