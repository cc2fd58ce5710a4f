//! Health and reaper loop.
//!
//! Each cycle checks every live session: dead agents become `error`, stalled
//! spawns become `error`, sessions past their ceiling are ended through the
//! normal termination path, and old terminal records are purged. One
//! session's failure never stops the cycle.
//!
//! Terminations take up to the grace window each, so the listing taken at
//! the start of a cycle goes stale. Every record is re-read before it is
//! judged, and every write is conditional on what the judgement saw.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use warmpool_core::config::LifecycleConfig;
use warmpool_core::db::unix_timestamp;

use super::OrchestrationError;
use super::lifecycle::SessionLifecycle;
use crate::storage::{Database, FailureKind, PoolCounter, Session, SessionStatus};
use crate::supervisor::{GroupHandle, ProcessSupervisor, is_alive, is_group_alive};

/// Reason recorded when a liveness check finds the agent gone.
pub const PROCESS_DIED_REASON: &str = "process died unexpectedly";

/// Counts from one reaper cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub checked: usize,
    pub died: usize,
    pub expired: usize,
    pub stalled: usize,
    pub purged: u64,
    pub failures: usize,
}

impl ReapReport {
    /// Nothing was changed or failed.
    pub const fn is_quiet(&self) -> bool {
        self.died + self.expired + self.stalled + self.failures == 0 && self.purged == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Healthy,
    Died,
    Expired,
    Stalled,
}

#[derive(Clone)]
pub struct Reaper {
    db: Database,
    supervisor: Arc<ProcessSupervisor>,
    lifecycle: SessionLifecycle,
    limits: LifecycleConfig,
}

impl Reaper {
    pub const fn new(
        db: Database,
        supervisor: Arc<ProcessSupervisor>,
        lifecycle: SessionLifecycle,
        limits: LifecycleConfig,
    ) -> Self {
        Self {
            db,
            supervisor,
            lifecycle,
            limits,
        }
    }

    pub async fn run_cycle(&self) -> Result<ReapReport, OrchestrationError> {
        self.run_cycle_at(unix_timestamp()).await
    }

    /// Run one cycle as if the clock read `now` (Unix seconds).
    pub async fn run_cycle_at(&self, now: i64) -> Result<ReapReport, OrchestrationError> {
        let sessions = self.db.list_live_sessions().await?;
        let mut report = ReapReport {
            checked: sessions.len(),
            ..ReapReport::default()
        };

        for listed in &sessions {
            match self.check_session(&listed.id, now).await {
                Ok(Verdict::Healthy) => continue,
                Ok(Verdict::Died) => report.died += 1,
                Ok(Verdict::Expired) => report.expired += 1,
                Ok(Verdict::Stalled) => report.stalled += 1,
                Err(e) => {
                    warn!(session_id = %listed.id, error = %e, "Reaper check failed");
                    report.failures += 1;
                    continue;
                }
            }
            if let Err(e) = self.db.increment_counter(PoolCounter::Reaped).await {
                warn!(error = %e, "Failed to bump reaped counter");
            }
        }

        let cutoff = now.saturating_sub(secs(self.limits.retention_secs));
        match self.db.purge_terminal_sessions(cutoff).await {
            Ok(purged) => report.purged = purged,
            Err(e) => {
                warn!(error = %e, "Failed to purge terminal sessions");
                report.failures += 1;
            }
        }

        if report.is_quiet() {
            debug!(checked = report.checked, "Reaper cycle clean");
        } else {
            info!(
                checked = report.checked,
                died = report.died,
                expired = report.expired,
                stalled = report.stalled,
                purged = report.purged,
                failures = report.failures,
                "Reaper cycle finished"
            );
        }
        Ok(report)
    }

    async fn check_session(&self, id: &str, now: i64) -> Result<Verdict, OrchestrationError> {
        // Purged by another instance since the listing.
        let Some(session) = self.db.find_session(id).await? else {
            return Ok(Verdict::Healthy);
        };
        let group = session
            .process_group()
            .map(|(pid, pgid)| GroupHandle { pid, pgid });

        match session.status() {
            Some(SessionStatus::Starting) => self.check_starting(&session, group, now).await,
            Some(SessionStatus::Ready) => self.check_ready(&session, group, now).await,
            _ => Ok(Verdict::Healthy),
        }
    }

    async fn check_starting(
        &self,
        session: &Session,
        group: Option<GroupHandle>,
        now: i64,
    ) -> Result<Verdict, OrchestrationError> {
        let budget = secs(self.limits.startup_timeout_secs) + secs(self.limits.grace_secs);
        if now - session.created_at <= budget {
            return Ok(Verdict::Healthy);
        }

        // No spawn worker is going to finish this one.
        let reason = if group.is_some() {
            "agent never completed readiness handshake"
        } else {
            "no agent process registered within startup timeout"
        };
        if !self.db.mark_stalled(&session.id, reason).await? {
            return Ok(Verdict::Healthy);
        }
        if let Some(handle) = group {
            self.lifecycle.reclaim_group(&session.id, handle).await;
        }
        warn!(session_id = %session.id, "Stalled spawn marked as error");
        Ok(Verdict::Stalled)
    }

    async fn check_ready(
        &self,
        session: &Session,
        group: Option<GroupHandle>,
        now: i64,
    ) -> Result<Verdict, OrchestrationError> {
        let alive = group.is_some_and(|g| is_alive(g.pid));
        if !alive {
            if !self
                .db
                .mark_error(&session.id, FailureKind::ProcessDied, PROCESS_DIED_REASON)
                .await?
            {
                return Ok(Verdict::Healthy);
            }
            warn!(session_id = %session.id, pid = ?session.pid, "Agent died unexpectedly");
            match group {
                // Reclaim orphaned descendants still in the group.
                Some(handle) if is_group_alive(handle.pgid) => {
                    self.lifecycle.reclaim_group(&session.id, handle).await;
                }
                _ => {
                    self.supervisor.forget(&session.id).await;
                }
            }
            return Ok(Verdict::Died);
        }

        let (started, ceiling, reason) = if let Some(started) = session.conversation_started_at {
            (
                started,
                self.limits.max_conversation_secs,
                "max conversation duration exceeded",
            )
        } else if session.owned {
            (
                session.assigned_at.unwrap_or(session.created_at),
                self.limits.idle_timeout_secs,
                "idle timeout",
            )
        } else {
            (
                session.created_at,
                self.limits.pool_idle_timeout_secs,
                "pool idle timeout",
            )
        };

        if now - started <= secs(ceiling) {
            return Ok(Verdict::Healthy);
        }
        Ok(if self.lifecycle.expire_session(session, reason).await? {
            Verdict::Expired
        } else {
            Verdict::Healthy
        })
    }

    /// Run cycles on `interval` until shutdown.
    pub fn spawn(
        self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the first immediate tick; recovery runs at startup.
            timer.tick().await;

            info!(interval_secs = interval.as_secs(), "Reaper started");
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = self.run_cycle().await {
                            warn!(error = %e, "Reaper cycle failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Reaper shutting down");
                        return;
                    }
                }
            }
        })
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn secs(value: u64) -> i64 {
    value as i64
}
