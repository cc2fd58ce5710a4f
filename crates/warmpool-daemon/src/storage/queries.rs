//! Session record queries.
//!
//! Every status transition is a conditional update on the current status, so
//! concurrent writers (other spawn workers, the reaper, other instances)
//! cannot move a record backwards or out of a terminal state.

use warmpool_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{FailureKind, PoolCounter, Session, SessionConfig, SessionStatus};
use super::queries_pool::{bump_counter, export_counter};

/// Parameters for a new `starting` record.
#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    pub id: &'a str,
    pub instance_id: &'a str,
    /// Spawned for the pre-warm pool rather than for a waiting caller.
    pub pool_bound: bool,
    pub caller_ref: Option<&'a str>,
    pub config: &'a SessionConfig,
    pub log_ref: &'a str,
}

/// Result of a conditional insert.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// This call created the record and owns the spawn.
    Created(Session),
    /// A record with that id already existed; nothing was written.
    Existing(Session),
}

impl Database {
    /// Insert a `starting` record unless one already exists for the id.
    pub async fn create_session(
        &self,
        new: &NewSession<'_>,
    ) -> Result<CreateOutcome, DatabaseError> {
        let now = unix_timestamp();
        let owned = !new.pool_bound;

        let result = sqlx::query(
            r"
            INSERT INTO sessions
                (id, status, instance_id, pool_bound, owned, caller_ref,
                 voice_id, opening_line, system_prompt, log_ref,
                 created_at, updated_at, assigned_at)
            VALUES (?, 'starting', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            ",
        )
        .bind(new.id)
        .bind(new.instance_id)
        .bind(new.pool_bound)
        .bind(owned)
        .bind(new.caller_ref)
        .bind(new.config.voice_id.as_deref())
        .bind(new.config.opening_line.as_deref())
        .bind(new.config.system_prompt.as_deref())
        .bind(new.log_ref)
        .bind(now)
        .bind(now)
        .bind(owned.then_some(now))
        .execute(self.pool())
        .await?;

        let session = self.get_session(new.id).await?;
        if result.rows_affected() == 1 {
            Ok(CreateOutcome::Created(session))
        } else {
            Ok(CreateOutcome::Existing(session))
        }
    }

    /// Get a session by ID.
    pub async fn get_session(&self, id: &str) -> Result<Session, DatabaseError> {
        self.find_session(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Session {id}")))
    }

    /// Get a session by ID, `None` when absent.
    pub async fn find_session(&self, id: &str) -> Result<Option<Session>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    /// Record the process group of a freshly spawned agent.
    ///
    /// The durable `agent_pids` row is always written; the session columns
    /// only while it is still `starting`. Returns whether the session was
    /// still `starting`.
    pub async fn record_process(
        &self,
        id: &str,
        pid: i32,
        pgid: i32,
        instance_id: &str,
    ) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r"
            INSERT INTO agent_pids (session_id, pid, pgid, instance_id, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                pid = excluded.pid,
                pgid = excluded.pgid,
                instance_id = excluded.instance_id,
                recorded_at = excluded.recorded_at
            ",
        )
        .bind(id)
        .bind(pid)
        .bind(pgid)
        .bind(instance_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            "UPDATE sessions SET pid = ?, pgid = ?, updated_at = ? WHERE id = ? AND status = 'starting'",
        )
        .bind(pid)
        .bind(pgid)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(updated == 1)
    }

    /// `starting → ready`. Pool-bound sessions join the pool set in the same
    /// transaction. Returns `false` if the session was no longer `starting`.
    pub async fn mark_ready(&self, id: &str, join_pool: bool) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query(
            "UPDATE sessions SET status = 'ready', updated_at = ? WHERE id = ? AND status = 'starting'",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 1 {
            if join_pool {
                sqlx::query("INSERT INTO pool_members (session_id, added_at) VALUES (?, ?)")
                    .bind(id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
            }
            bump_counter(&mut tx, PoolCounter::Spawned).await?;
        }

        tx.commit().await?;
        if updated == 1 {
            export_counter(PoolCounter::Spawned);
        }
        Ok(updated == 1)
    }

    /// Move a live session to `error`, dropping it from the pool set.
    ///
    /// Returns `false` if the session was already terminal.
    pub async fn mark_error(
        &self,
        id: &str,
        kind: FailureKind,
        reason: &str,
    ) -> Result<bool, DatabaseError> {
        self.fail(id, kind, reason, "status IN ('starting', 'ready')")
            .await
    }

    /// `starting → error` for a spawn that never finished. Returns `false`
    /// if the session had moved on.
    pub async fn mark_stalled(&self, id: &str, reason: &str) -> Result<bool, DatabaseError> {
        self.fail(id, FailureKind::StartupStalled, reason, "status = 'starting'")
            .await
    }

    async fn fail(
        &self,
        id: &str,
        kind: FailureKind,
        reason: &str,
        from: &'static str,
    ) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();
        let sql = format!(
            "UPDATE sessions SET status = 'error', failure_kind = ?, reason = ?, \
             updated_at = ?, ended_at = ? WHERE id = ? AND {from}"
        );
        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(reason)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if updated == 1 {
            sqlx::query("DELETE FROM pool_members WHERE session_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            bump_counter(&mut tx, PoolCounter::Failed).await?;
        }

        tx.commit().await?;
        if updated == 1 {
            export_counter(PoolCounter::Failed);
        }
        Ok(updated == 1)
    }

    /// Move a live session to `ended`, dropping it from the pool set.
    ///
    /// Returns `false` if the session was already terminal.
    pub async fn mark_ended(&self, id: &str, reason: &str) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE sessions
            SET status = 'ended', reason = ?, updated_at = ?, ended_at = ?
            WHERE id = ? AND status IN ('starting', 'ready')
            ",
        )
        .bind(reason)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 1 {
            sqlx::query("DELETE FROM pool_members WHERE session_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(updated == 1)
    }

    /// `ready → ended` for a ceiling decided on `seen`.
    ///
    /// Only applies while ownership and conversation start still match the
    /// snapshot, so a member claimed (or a conversation started) after the
    /// decision is left alone. Returns whether this call ended the session.
    pub async fn mark_expired(&self, seen: &Session, reason: &str) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE sessions
            SET status = 'ended', reason = ?, updated_at = ?, ended_at = ?
            WHERE id = ? AND status = 'ready' AND owned = ?
              AND conversation_started_at IS ?
            ",
        )
        .bind(reason)
        .bind(now)
        .bind(now)
        .bind(&seen.id)
        .bind(seen.owned)
        .bind(seen.conversation_started_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 1 {
            sqlx::query("DELETE FROM pool_members WHERE session_id = ?")
                .bind(&seen.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(updated == 1)
    }

    /// Record the first realtime participant join. Only the first call on a
    /// `ready` session writes; returns whether this call did.
    pub async fn set_conversation_started(&self, id: &str, at: i64) -> Result<bool, DatabaseError> {
        let updated = sqlx::query(
            r"
            UPDATE sessions SET conversation_started_at = ?, updated_at = ?
            WHERE id = ? AND status = 'ready' AND conversation_started_at IS NULL
            ",
        )
        .bind(at)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    /// Most recent live, owned session handed to the given caller reference.
    pub async fn find_live_session_by_caller_ref(
        &self,
        caller_ref: &str,
    ) -> Result<Option<Session>, DatabaseError> {
        Ok(sqlx::query_as::<_, Session>(
            r"
            SELECT * FROM sessions
            WHERE caller_ref = ? AND owned = 1 AND status IN ('starting', 'ready')
            ORDER BY assigned_at DESC
            LIMIT 1
            ",
        )
        .bind(caller_ref)
        .fetch_optional(self.pool())
        .await?)
    }

    /// All `starting`/`ready` sessions, oldest first.
    pub async fn list_live_sessions(&self) -> Result<Vec<Session>, DatabaseError> {
        Ok(sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE status IN ('starting', 'ready') ORDER BY created_at ASC",
        )
        .fetch_all(self.pool())
        .await?)
    }

    /// Live sessions whose process group was created by the given instance.
    pub async fn list_live_sessions_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<Session>, DatabaseError> {
        Ok(sqlx::query_as::<_, Session>(
            r"
            SELECT * FROM sessions
            WHERE instance_id = ? AND status IN ('starting', 'ready')
            ORDER BY created_at ASC
            ",
        )
        .bind(instance_id)
        .fetch_all(self.pool())
        .await?)
    }

    /// Sessions with a running conversation (started, not terminal).
    pub async fn list_conversations(&self) -> Result<Vec<Session>, DatabaseError> {
        Ok(sqlx::query_as::<_, Session>(
            r"
            SELECT * FROM sessions
            WHERE conversation_started_at IS NOT NULL AND ended_at IS NULL
              AND status = 'ready'
            ORDER BY conversation_started_at ASC
            ",
        )
        .fetch_all(self.pool())
        .await?)
    }

    /// Count sessions in a given status.
    pub async fn count_sessions(&self, status: SessionStatus) -> Result<i64, DatabaseError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(self.pool())
                .await?,
        )
    }

    /// Pool-bound spawns that have not finished their handshake yet.
    pub async fn count_pending_pool_spawns(&self) -> Result<i64, DatabaseError> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM sessions WHERE pool_bound = 1 AND owned = 0 AND status = 'starting'",
        )
        .fetch_one(self.pool())
        .await?)
    }

    /// Delete terminal records (and, by cascade, their `agent_pids` rows)
    /// that ended before `before`.
    pub async fn purge_terminal_sessions(&self, before: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM sessions WHERE status IN ('error', 'ended') AND ended_at < ?",
        )
        .bind(before)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }
}
