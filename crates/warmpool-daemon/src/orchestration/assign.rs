//! Assignment service: hand a caller an agent, instantly from the pool when
//! one is idle, otherwise by spawning a new one.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::OrchestrationError;
use super::spawner::{SpawnError, SpawnOrder, SpawnPool, SubmitOutcome};
use crate::storage::{Database, DatabaseError, Session, SessionConfig, SessionStatus};

/// How quickly the caller can use the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    /// Taken from the pool; already `ready`.
    Instant,
    /// Spawned on demand; poll until `ready`.
    Deferred,
}

/// What the caller gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub session_id: String,
    pub status: SessionStatus,
    pub latency: LatencyClass,
}

impl Assignment {
    fn from_session(session: &Session, latency: LatencyClass) -> Result<Self, OrchestrationError> {
        let status = session.status().ok_or_else(|| {
            DatabaseError::Corrupt(format!(
                "session {} has status {:?}",
                session.id, session.status
            ))
        })?;
        Ok(Self {
            session_id: session.id.clone(),
            status,
            latency,
        })
    }

    /// A caller's existing live session, handed back on retry.
    fn resumed(session: &Session) -> Result<Self, OrchestrationError> {
        let latency = if session.status() == Some(SessionStatus::Ready) {
            LatencyClass::Instant
        } else {
            LatencyClass::Deferred
        };
        Self::from_session(session, latency)
    }
}

#[derive(Clone)]
pub struct AssignmentService {
    db: Database,
    spawner: SpawnPool,
    /// Wakes the pre-warm scheduler after the pool shrinks.
    prewarm: Option<Arc<Notify>>,
}

impl AssignmentService {
    pub const fn new(db: Database, spawner: SpawnPool, prewarm: Option<Arc<Notify>>) -> Self {
        Self {
            db,
            spawner,
            prewarm,
        }
    }

    /// Assign an agent to a caller.
    ///
    /// `hint` is the caller's own session reference. The state store allows
    /// one live session per reference, so retries with the same hint (even
    /// concurrent ones, from any instance) get that one session back.
    /// Otherwise an idle pool member is claimed atomically; when the pool is
    /// empty (or the race for the last member is lost) a new agent is spawned
    /// under the hint, or under a fresh id if the hint names another record.
    pub async fn assign(
        &self,
        hint: Option<&str>,
        config: SessionConfig,
    ) -> Result<Assignment, OrchestrationError> {
        if let Some(hint) = hint
            && let Some(existing) = self.db.find_live_session_by_caller_ref(hint).await?
        {
            debug!(session_id = %existing.id, hint, "Returning existing assignment");
            return Assignment::resumed(&existing);
        }

        match self.db.claim_pool_member(&config, hint).await {
            Ok(Some(session)) => {
                info!(session_id = %session.id, "Assigned pre-warmed agent");
                self.nudge_prewarm();
                return Assignment::from_session(&session, LatencyClass::Instant);
            }
            Ok(None) => {}
            Err(DatabaseError::Conflict(reason)) => return self.hint_taken(hint, reason).await,
            Err(e) => return Err(e.into()),
        }

        let mut session_id =
            hint.map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);
        loop {
            let order = SpawnOrder {
                session_id: session_id.clone(),
                config: config.clone(),
                pool_bound: false,
                caller_ref: hint.map(str::to_string),
            };
            match self.spawner.submit(order).await {
                Ok(SubmitOutcome::Accepted(session)) => {
                    info!(session_id = %session.id, "Pool empty, spawning agent on demand");
                    self.nudge_prewarm();
                    return Assignment::from_session(&session, LatencyClass::Deferred);
                }
                Ok(SubmitOutcome::Duplicate(existing))
                    if existing.owned
                        && !existing.is_terminal()
                        && hint.is_some()
                        && existing.caller_ref.as_deref() == hint =>
                {
                    return Assignment::resumed(&existing);
                }
                Ok(SubmitOutcome::Duplicate(existing)) => {
                    // Never hand out a finished record or someone else's session.
                    debug!(
                        session_id = %existing.id,
                        status = %existing.status,
                        "Id taken, retrying with a fresh id"
                    );
                    session_id = uuid::Uuid::new_v4().to_string();
                }
                Err(SpawnError::Database(DatabaseError::Conflict(reason))) => {
                    return self.hint_taken(hint, reason).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// A concurrent request with the same hint won the write; return its
    /// session.
    async fn hint_taken(
        &self,
        hint: Option<&str>,
        reason: String,
    ) -> Result<Assignment, OrchestrationError> {
        if let Some(hint) = hint
            && let Some(existing) = self.db.find_live_session_by_caller_ref(hint).await?
        {
            debug!(
                session_id = %existing.id,
                hint,
                "Concurrent assignment won, reusing its session"
            );
            return Assignment::resumed(&existing);
        }
        Err(DatabaseError::Conflict(reason).into())
    }

    /// Current status of a session, for callers polling a deferred assignment.
    pub async fn poll(&self, session_id: &str) -> Result<Session, OrchestrationError> {
        self.db
            .find_session(session_id)
            .await?
            .ok_or_else(|| OrchestrationError::UnknownSession(session_id.to_string()))
    }

    fn nudge_prewarm(&self) {
        if let Some(nudge) = &self.prewarm {
            nudge.notify_one();
        }
    }
}
