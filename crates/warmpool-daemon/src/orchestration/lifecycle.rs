//! Session end, conversation start, and instance shutdown.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};
use warmpool_core::db::unix_timestamp;

use super::OrchestrationError;
use crate::storage::{Database, Session, SessionStatus};
use crate::supervisor::{GroupHandle, ProcessSupervisor, TerminationOutcome, terminate_group};

/// Result of an explicit end.
#[derive(Debug, Clone, Serialize)]
pub struct EndOutcome {
    pub session_id: String,
    pub status: SessionStatus,
    /// Whether this call moved the record to `ended`.
    pub transitioned: bool,
    /// `None` when no process group was known for the session.
    pub termination: Option<TerminationOutcome>,
}

/// Owns the termination path shared by explicit ends, the reaper and shutdown.
#[derive(Clone)]
pub struct SessionLifecycle {
    db: Database,
    supervisor: Arc<ProcessSupervisor>,
    grace: Duration,
}

impl SessionLifecycle {
    pub const fn new(db: Database, supervisor: Arc<ProcessSupervisor>, grace: Duration) -> Self {
        Self {
            db,
            supervisor,
            grace,
        }
    }

    /// End a session at any status and terminate its process group.
    ///
    /// Idempotent: ending a terminal session leaves the record unchanged and
    /// only signals a group this instance still tracks.
    pub async fn end_session(
        &self,
        session_id: &str,
        reason: &str,
    ) -> Result<EndOutcome, OrchestrationError> {
        let session = self
            .db
            .find_session(session_id)
            .await?
            .ok_or_else(|| OrchestrationError::UnknownSession(session_id.to_string()))?;

        let transitioned = self.db.mark_ended(session_id, reason).await?;
        let tracked = self.supervisor.handle(session_id).await;

        // A recorded pgid of a long-dead session may have been reused.
        let group = if transitioned {
            tracked.or(self.recorded_group(&session).await?)
        } else {
            tracked
        };

        let termination = match group {
            Some(handle) => self.terminate(session_id, handle).await,
            None => None,
        };

        let status = self
            .db
            .get_session(session_id)
            .await?
            .status()
            .unwrap_or(SessionStatus::Ended);

        if transitioned {
            info!(session_id, reason, ?termination, "Session ended");
        }
        Ok(EndOutcome {
            session_id: session_id.to_string(),
            status,
            transitioned,
            termination,
        })
    }

    /// End a `ready` session whose ceiling was decided on `seen`.
    ///
    /// The record is only ended (and the group only signaled) while its
    /// ownership and conversation start still match `seen`. Returns whether
    /// this call ended the session.
    pub async fn expire_session(
        &self,
        seen: &Session,
        reason: &str,
    ) -> Result<bool, OrchestrationError> {
        if !self.db.mark_expired(seen, reason).await? {
            return Ok(false);
        }

        let group = match self.supervisor.handle(&seen.id).await {
            Some(handle) => Some(handle),
            None => self.recorded_group(seen).await?,
        };
        let termination = match group {
            Some(handle) => self.terminate(&seen.id, handle).await,
            None => None,
        };
        info!(session_id = %seen.id, reason, ?termination, "Session expired");
        Ok(true)
    }

    /// Record the first realtime participant join. Returns whether this call
    /// set the timestamp.
    pub async fn mark_conversation_started(
        &self,
        session_id: &str,
    ) -> Result<bool, OrchestrationError> {
        if self.db.find_session(session_id).await?.is_none() {
            return Err(OrchestrationError::UnknownSession(session_id.to_string()));
        }
        let started = self
            .db
            .set_conversation_started(session_id, unix_timestamp())
            .await?;
        if started {
            info!(session_id, "Conversation started");
        }
        Ok(started)
    }

    /// Terminate a group whose leader is already gone, without touching the
    /// record.
    pub async fn reclaim_group(&self, session_id: &str, handle: GroupHandle) {
        self.terminate(session_id, handle).await;
    }

    /// End every live session spawned by `instance_id`. Returns how many were
    /// ended.
    pub async fn shutdown_owned(&self, instance_id: &str) -> Result<usize, OrchestrationError> {
        let sessions = self.db.list_live_sessions_for_instance(instance_id).await?;
        let mut ended = 0;
        for session in sessions {
            match self.end_session(&session.id, "orchestrator shutdown").await {
                Ok(outcome) if outcome.transitioned => ended += 1,
                Ok(_) => {}
                Err(e) => warn!(session_id = %session.id, error = %e, "Failed to end session on shutdown"),
            }
        }
        Ok(ended)
    }

    async fn recorded_group(&self, session: &Session) -> Result<Option<GroupHandle>, OrchestrationError> {
        if let Some((pid, pgid)) = session.process_group() {
            return Ok(Some(GroupHandle { pid, pgid }));
        }
        // The session columns are only written while `starting`; the durable
        // record may still know the group.
        Ok(self.db.agent_pid(&session.id).await?.and_then(|record| {
            Some(GroupHandle {
                pid: i32::try_from(record.pid).ok()?,
                pgid: i32::try_from(record.pgid).ok()?,
            })
        }))
    }

    async fn terminate(&self, session_id: &str, handle: GroupHandle) -> Option<TerminationOutcome> {
        let outcome = match terminate_group(handle.pgid, self.grace).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(session_id, pgid = handle.pgid, error = %e, "Failed to terminate agent group");
                None
            }
        };
        self.supervisor.forget(session_id).await;
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use warmpool_core::config::AgentConfig;

    use super::*;
    use crate::storage::{NewSession, SessionConfig};
    use crate::supervisor::{SpawnRequest, is_group_alive};

    async fn setup() -> (Database, Arc<ProcessSupervisor>, SessionLifecycle) {
        let db = Database::open_in_memory().await.unwrap();
        let supervisor = Arc::new(ProcessSupervisor::new(AgentConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "echo READY; sleep 30 & wait".to_string()],
            ready_sentinel: "READY".to_string(),
            log_dir: None,
        }));
        let lifecycle = SessionLifecycle::new(
            db.clone(),
            Arc::clone(&supervisor),
            Duration::from_secs(2),
        );
        (db, supervisor, lifecycle)
    }

    async fn live_session(db: &Database, supervisor: &ProcessSupervisor, id: &str) -> i32 {
        let config = SessionConfig::default();
        db.create_session(&NewSession {
            id,
            instance_id: "inst-a",
            pool_bound: false,
            caller_ref: None,
            config: &config,
            log_ref: "file:///tmp/x.log",
        })
        .await
        .unwrap();
        let agent = supervisor
            .spawn(SpawnRequest {
                session_id: id,
                config: &config,
                log_ref: "file:///tmp/x.log",
            })
            .await
            .unwrap();
        agent.readiness.wait(Duration::from_secs(5)).await.unwrap();
        db.record_process(id, agent.pid, agent.pgid, "inst-a").await.unwrap();
        db.mark_ready(id, false).await.unwrap();
        agent.pgid
    }

    #[tokio::test]
    async fn end_terminates_group_and_is_idempotent() {
        let (db, supervisor, lifecycle) = setup().await;
        let pgid = live_session(&db, &supervisor, "s-1").await;

        let first = lifecycle.end_session("s-1", "caller hung up").await.unwrap();
        assert!(first.transitioned);
        assert_eq!(first.status, SessionStatus::Ended);
        assert_eq!(first.termination, Some(TerminationOutcome::Graceful));
        assert!(!is_group_alive(pgid));
        assert!(supervisor.handle("s-1").await.is_none());

        let second = lifecycle.end_session("s-1", "caller hung up").await.unwrap();
        assert!(!second.transitioned);
        assert_eq!(second.status, SessionStatus::Ended);
        assert_eq!(second.termination, None);
    }

    #[tokio::test]
    async fn end_unknown_session_is_an_error() {
        let (_db, _supervisor, lifecycle) = setup().await;
        let err = lifecycle.end_session("nope", "x").await.unwrap_err();
        assert!(matches!(err, OrchestrationError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn end_starting_session_without_process() {
        let (db, _supervisor, lifecycle) = setup().await;
        let config = SessionConfig::default();
        db.create_session(&NewSession {
            id: "s-2",
            instance_id: "inst-a",
            pool_bound: false,
            caller_ref: None,
            config: &config,
            log_ref: "file:///tmp/x.log",
        })
        .await
        .unwrap();

        let outcome = lifecycle.end_session("s-2", "cancelled").await.unwrap();
        assert!(outcome.transitioned);
        assert_eq!(outcome.termination, None);
    }

    #[tokio::test]
    async fn conversation_start_only_once() {
        let (db, supervisor, lifecycle) = setup().await;
        let _pgid = live_session(&db, &supervisor, "s-3").await;

        assert!(lifecycle.mark_conversation_started("s-3").await.unwrap());
        assert!(!lifecycle.mark_conversation_started("s-3").await.unwrap());
        lifecycle.end_session("s-3", "done").await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_ends_only_own_sessions() {
        let (db, supervisor, lifecycle) = setup().await;
        let pgid = live_session(&db, &supervisor, "mine").await;

        let config = SessionConfig::default();
        db.create_session(&NewSession {
            id: "theirs",
            instance_id: "inst-b",
            pool_bound: false,
            caller_ref: None,
            config: &config,
            log_ref: "file:///tmp/y.log",
        })
        .await
        .unwrap();

        assert_eq!(lifecycle.shutdown_owned("inst-a").await.unwrap(), 1);
        assert!(!is_group_alive(pgid));
        let theirs = db.get_session("theirs").await.unwrap();
        assert_eq!(theirs.status(), Some(SessionStatus::Starting));
    }
}
