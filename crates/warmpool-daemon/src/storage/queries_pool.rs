//! Pre-warm pool set, counters, operator settings and durable pid records.

use sqlx::SqliteConnection;
use tracing::warn;
use warmpool_core::db::unix_timestamp;
use warmpool_core::instruments;

use super::db::{Database, DatabaseError};
use super::models::{AgentPid, PoolCounter, PoolStats, Session, SessionConfig};

/// Settings key for the operator-set pool target.
const POOL_TARGET_KEY: &str = "pool:target";

/// Increment a `pool_stats` counter on an open connection or transaction.
pub(super) async fn bump_counter(
    conn: &mut SqliteConnection,
    counter: PoolCounter,
) -> Result<(), DatabaseError> {
    sqlx::query("UPDATE pool_stats SET value = value + 1 WHERE name = ?")
        .bind(counter.as_str())
        .execute(conn)
        .await?;
    Ok(())
}

/// Mirror a committed counter bump to the metrics exporter.
pub(super) fn export_counter(counter: PoolCounter) {
    instruments::record_pool_event(counter.as_str());
}

impl Database {
    // =========================================================================
    // Pool set
    // =========================================================================

    /// Atomically take the oldest pool member and hand it to a caller.
    ///
    /// The member is removed from the set and re-stamped in one transaction,
    /// so two concurrent claims can never return the same session. Members
    /// whose record is no longer an unowned `ready` session are discarded and
    /// the next one is tried. Returns `None` when the pool is empty.
    ///
    /// Fails with [`DatabaseError::Conflict`] when `caller_ref` already owns a
    /// live session; the transaction rolls back and the member stays pooled.
    pub async fn claim_pool_member(
        &self,
        config: &SessionConfig,
        caller_ref: Option<&str>,
    ) -> Result<Option<Session>, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        loop {
            let popped: Option<String> = sqlx::query_scalar(
                r"
                DELETE FROM pool_members
                WHERE seq = (SELECT MIN(seq) FROM pool_members)
                RETURNING session_id
                ",
            )
            .fetch_optional(&mut *tx)
            .await?;

            let Some(session_id) = popped else {
                tx.commit().await?;
                return Ok(None);
            };

            let claimed = sqlx::query(
                r"
                UPDATE sessions
                SET owned = 1, assigned_at = ?, caller_ref = ?,
                    voice_id = ?, opening_line = ?, system_prompt = ?, updated_at = ?
                WHERE id = ? AND status = 'ready' AND owned = 0
                ",
            )
            .bind(now)
            .bind(caller_ref)
            .bind(config.voice_id.as_deref())
            .bind(config.opening_line.as_deref())
            .bind(config.system_prompt.as_deref())
            .bind(now)
            .bind(&session_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if claimed == 0 {
                warn!(session_id, "Discarding stale pool member");
                continue;
            }

            bump_counter(&mut tx, PoolCounter::Assigned).await?;

            let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
                .bind(&session_id)
                .fetch_one(&mut *tx)
                .await?;

            tx.commit().await?;
            export_counter(PoolCounter::Assigned);
            return Ok(Some(session));
        }
    }

    /// Number of sessions currently in the pool set.
    pub async fn pool_size(&self) -> Result<i64, DatabaseError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM pool_members")
            .fetch_one(self.pool())
            .await?)
    }

    /// Pool member ids in claim order.
    pub async fn pool_member_ids(&self) -> Result<Vec<String>, DatabaseError> {
        Ok(
            sqlx::query_scalar("SELECT session_id FROM pool_members ORDER BY seq ASC")
                .fetch_all(self.pool())
                .await?,
        )
    }

    // =========================================================================
    // Counters and settings
    // =========================================================================

    /// Increment one `pool_stats` counter.
    pub async fn increment_counter(&self, counter: PoolCounter) -> Result<(), DatabaseError> {
        let mut conn = self.pool().acquire().await?;
        bump_counter(&mut conn, counter).await?;
        export_counter(counter);
        Ok(())
    }

    /// Snapshot of the counters and the live pool size.
    pub async fn pool_stats(&self) -> Result<PoolStats, DatabaseError> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT name, value FROM pool_stats")
            .fetch_all(self.pool())
            .await?;

        let mut stats = PoolStats {
            pool_size: self.pool_size().await?,
            ..PoolStats::default()
        };
        for (name, value) in rows {
            match name.as_str() {
                "total_spawned" => stats.total_spawned = value,
                "total_assigned" => stats.total_assigned = value,
                "total_failed" => stats.total_failed = value,
                "total_reaped" => stats.total_reaped = value,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Operator-set pool target, if one has been stored.
    pub async fn pool_target(&self) -> Result<Option<u32>, DatabaseError> {
        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(POOL_TARGET_KEY)
            .fetch_optional(self.pool())
            .await?;

        raw.map(|v| {
            v.parse::<u32>()
                .map_err(|e| DatabaseError::Corrupt(format!("pool target {v:?}: {e}")))
        })
        .transpose()
    }

    /// Store the pool target shared by every instance.
    pub async fn set_pool_target(&self, target: u32) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            ",
        )
        .bind(POOL_TARGET_KEY)
        .bind(target.to_string())
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // =========================================================================
    // Agent pid records
    // =========================================================================

    /// Durable process group record for a session.
    pub async fn agent_pid(&self, session_id: &str) -> Result<Option<AgentPid>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, AgentPid>("SELECT * FROM agent_pids WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    /// Pid records of live sessions spawned by the given instance.
    pub async fn list_live_agent_pids(
        &self,
        instance_id: &str,
    ) -> Result<Vec<AgentPid>, DatabaseError> {
        Ok(sqlx::query_as::<_, AgentPid>(
            r"
            SELECT a.* FROM agent_pids a
            JOIN sessions s ON s.id = a.session_id
            WHERE a.instance_id = ? AND s.status IN ('starting', 'ready')
            ORDER BY a.recorded_at ASC
            ",
        )
        .bind(instance_id)
        .fetch_all(self.pool())
        .await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::storage::{CreateOutcome, NewSession};

    async fn ready_member(db: &Database, id: &str) {
        let config = SessionConfig::default();
        let outcome = db
            .create_session(&NewSession {
                id,
                instance_id: "inst-a",
                pool_bound: true,
                caller_ref: None,
                config: &config,
                log_ref: "file:///tmp/x.log",
            })
            .await
            .unwrap();
        assert!(matches!(outcome, CreateOutcome::Created(_)));
        assert!(db.mark_ready(id, true).await.unwrap());
    }

    #[tokio::test]
    async fn claim_is_fifo_and_restamps() {
        let db = Database::open_in_memory().await.unwrap();
        ready_member(&db, "p-1").await;
        ready_member(&db, "p-2").await;

        let config = SessionConfig {
            voice_id: Some("alloy".into()),
            opening_line: Some("Hi there".into()),
            system_prompt: None,
        };
        let claimed = db
            .claim_pool_member(&config, Some("caller-9"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(claimed.id, "p-1");
        assert!(claimed.owned);
        assert!(claimed.assigned_at.is_some());
        assert_eq!(claimed.voice_id.as_deref(), Some("alloy"));
        assert_eq!(claimed.caller_ref.as_deref(), Some("caller-9"));
        assert_eq!(db.pool_member_ids().await.unwrap(), vec!["p-2".to_string()]);
        assert_eq!(db.pool_stats().await.unwrap().total_assigned, 1);
    }

    #[tokio::test]
    async fn claim_on_empty_pool_returns_none() {
        let db = Database::open_in_memory().await.unwrap();
        let claimed = db
            .claim_pool_member(&SessionConfig::default(), None)
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn claim_skips_stale_members() {
        let db = Database::open_in_memory().await.unwrap();
        ready_member(&db, "p-1").await;
        ready_member(&db, "p-2").await;

        // A foreign writer ended p-1 without touching the pool set.
        sqlx::query("UPDATE sessions SET status = 'ended', ended_at = 0 WHERE id = 'p-1'")
            .execute(db.pool())
            .await
            .unwrap();

        let claimed = db
            .claim_pool_member(&SessionConfig::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, "p-2");
        assert_eq!(db.pool_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pool_target_round_trips_through_settings() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(db.pool_target().await.unwrap(), None);
        db.set_pool_target(3).await.unwrap();
        db.set_pool_target(7).await.unwrap();
        assert_eq!(db.pool_target().await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn garbage_pool_target_is_corrupt() {
        let db = Database::open_in_memory().await.unwrap();
        sqlx::query("INSERT INTO settings (key, value, updated_at) VALUES ('pool:target', 'lots', 0)")
            .execute(db.pool())
            .await
            .unwrap();
        assert!(matches!(
            db.pool_target().await,
            Err(DatabaseError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn counters_start_at_zero() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(db.pool_stats().await.unwrap(), PoolStats::default());
        db.increment_counter(PoolCounter::Reaped).await.unwrap();
        assert_eq!(db.pool_stats().await.unwrap().total_reaped, 1);
    }

    #[tokio::test]
    async fn live_pid_listing_skips_terminal_sessions() {
        let db = Database::open_in_memory().await.unwrap();
        ready_member(&db, "p-1").await;
        ready_member(&db, "p-2").await;
        db.record_process("p-1", 100, 100, "inst-a").await.unwrap();
        db.record_process("p-2", 200, 200, "inst-a").await.unwrap();
        db.mark_ended("p-2", "done").await.unwrap();

        let pids = db.list_live_agent_pids("inst-a").await.unwrap();
        assert_eq!(pids.len(), 1);
        assert_eq!(pids[0].session_id, "p-1");
        assert!(db.list_live_agent_pids("inst-b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_for_caller_with_live_session_conflicts() {
        let db = Database::open_in_memory().await.unwrap();
        ready_member(&db, "p-1").await;
        ready_member(&db, "p-2").await;
        let config = SessionConfig::default();

        db.claim_pool_member(&config, Some("call-x")).await.unwrap().unwrap();
        let err = db
            .claim_pool_member(&config, Some("call-x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)), "{err:?}");

        assert_eq!(db.pool_member_ids().await.unwrap(), vec!["p-2".to_string()]);
        let untouched = db.get_session("p-2").await.unwrap();
        assert!(!untouched.owned);
        assert_eq!(db.pool_stats().await.unwrap().total_assigned, 1);
    }
}
