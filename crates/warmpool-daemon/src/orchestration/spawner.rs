//! Bounded pool of spawn workers.
//!
//! [`SpawnPool::submit`] claims a session id in the state store and hands the
//! spawn to a background worker. At most `max_concurrent_spawns` workers run
//! the supervisor at once; the rest wait for a semaphore permit.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::storage::{
    CreateOutcome, Database, DatabaseError, FailureKind, NewSession, Session, SessionConfig,
};
use crate::supervisor::{ProcessSupervisor, SpawnRequest, SupervisorError, terminate_group};

/// A request to launch one agent.
#[derive(Debug, Clone)]
pub struct SpawnOrder {
    pub session_id: String,
    pub config: SessionConfig,
    /// Spawned to refill the pre-warm pool rather than for a waiting caller.
    pub pool_bound: bool,
    pub caller_ref: Option<String>,
}

/// Result of a submission.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// A worker will spawn the agent; the record is `starting`.
    Accepted(Session),
    /// A record already existed for the id; nothing was spawned.
    Duplicate(Session),
}

impl SubmitOutcome {
    pub const fn session(&self) -> &Session {
        match self {
            Self::Accepted(s) | Self::Duplicate(s) => s,
        }
    }
}

/// Errors from the spawn path.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Static settings for the spawn workers.
#[derive(Debug, Clone)]
pub struct SpawnSettings {
    pub instance_id: String,
    pub max_concurrent: usize,
    pub log_dir: PathBuf,
    pub startup_timeout: Duration,
    pub grace: Duration,
}

struct Inner {
    db: Database,
    supervisor: Arc<ProcessSupervisor>,
    semaphore: Arc<Semaphore>,
    settings: SpawnSettings,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Bounded-concurrency spawn worker pool. Cheap to clone.
#[derive(Clone)]
pub struct SpawnPool {
    inner: Arc<Inner>,
}

impl SpawnPool {
    pub fn new(db: Database, supervisor: Arc<ProcessSupervisor>, settings: SpawnSettings) -> Self {
        let permits = settings.max_concurrent.max(1);
        info!(max_concurrent = permits, "Spawn pool created");
        Self {
            inner: Arc::new(Inner {
                db,
                supervisor,
                semaphore: Arc::new(Semaphore::new(permits)),
                settings,
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Log sink reference handed to the agent for `session_id`.
    pub fn log_ref(&self, session_id: &str) -> String {
        format!(
            "file://{}/{session_id}.log",
            self.inner.settings.log_dir.display()
        )
    }

    /// Register a `starting` record and queue the spawn.
    ///
    /// A second submission for an id that already has a record (in any
    /// status) returns [`SubmitOutcome::Duplicate`] without spawning.
    pub async fn submit(&self, order: SpawnOrder) -> Result<SubmitOutcome, SpawnError> {
        let log_ref = self.log_ref(&order.session_id);
        let outcome = self
            .inner
            .db
            .create_session(&NewSession {
                id: &order.session_id,
                instance_id: &self.inner.settings.instance_id,
                pool_bound: order.pool_bound,
                caller_ref: order.caller_ref.as_deref(),
                config: &order.config,
                log_ref: &log_ref,
            })
            .await?;

        let session = match outcome {
            CreateOutcome::Existing(session) => {
                debug!(
                    session_id = %session.id,
                    status = %session.status,
                    "Duplicate spawn request ignored"
                );
                return Ok(SubmitOutcome::Duplicate(session));
            }
            CreateOutcome::Created(session) => session,
        };

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let session_id = order.session_id.clone();
            if let Err(e) = run_worker(&inner, order, log_ref).await {
                error!(session_id = %session_id, error = %e, "Spawn worker failed");
            }
            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        });

        Ok(SubmitOutcome::Accepted(session))
    }

    /// Number of spawns accepted but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every accepted spawn has finished.
    pub async fn drain(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stop accepting queued work; workers still waiting for a permit fail.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }
}

async fn run_worker(inner: &Inner, order: SpawnOrder, log_ref: String) -> Result<(), SpawnError> {
    let session_id = order.session_id.as_str();

    let Ok(_permit) = Arc::clone(&inner.semaphore).acquire_owned().await else {
        inner
            .db
            .mark_error(session_id, FailureKind::SpawnFailure, "spawn pool closed")
            .await?;
        return Ok(());
    };

    // Ended while queued.
    if inner.db.get_session(session_id).await?.is_terminal() {
        debug!(session_id, "Session ended before spawn started");
        return Ok(());
    }

    let agent = match inner
        .supervisor
        .spawn(SpawnRequest {
            session_id,
            config: &order.config,
            log_ref: &log_ref,
        })
        .await
    {
        Ok(agent) => agent,
        Err(e) => {
            warn!(session_id, error = %e, "Agent spawn failed");
            inner
                .db
                .mark_error(session_id, FailureKind::SpawnFailure, &e.to_string())
                .await?;
            return Ok(());
        }
    };
    let pgid = agent.pgid;

    let still_starting = match inner
        .db
        .record_process(session_id, agent.pid, pgid, &inner.settings.instance_id)
        .await
    {
        Ok(still_starting) => still_starting,
        Err(e) => {
            discard_group(inner, session_id, pgid).await;
            return Err(e.into());
        }
    };
    if !still_starting {
        info!(session_id, pgid, "Session ended during spawn, discarding agent");
        discard_group(inner, session_id, pgid).await;
        return Ok(());
    }

    let timeout = inner.settings.startup_timeout;
    match agent.readiness.wait(timeout).await {
        Ok(()) => {
            if inner.db.mark_ready(session_id, order.pool_bound).await? {
                info!(
                    session_id,
                    pid = agent.pid,
                    pgid,
                    pool_bound = order.pool_bound,
                    "Agent ready"
                );
            } else {
                info!(session_id, pgid, "Session ended during handshake, discarding agent");
                discard_group(inner, session_id, pgid).await;
            }
        }
        Err(e) => {
            let kind = match e {
                SupervisorError::ReadinessTimeout(_) => FailureKind::SpawnTimeout,
                _ => FailureKind::SpawnFailure,
            };
            warn!(session_id, pgid, error = %e, "Agent failed readiness handshake");
            discard_group(inner, session_id, pgid).await;
            inner.db.mark_error(session_id, kind, &e.to_string()).await?;
        }
    }

    Ok(())
}

/// Terminate a group this worker created and drop its handle.
async fn discard_group(inner: &Inner, session_id: &str, pgid: i32) {
    if let Err(e) = terminate_group(pgid, inner.settings.grace).await {
        warn!(session_id, pgid, error = %e, "Failed to terminate agent group");
    }
    inner.supervisor.forget(session_id).await;
}
