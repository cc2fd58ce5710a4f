//! Read-only duration observation for billing.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};
use warmpool_core::db::unix_timestamp;
use warmpool_core::instruments;

use crate::storage::{Database, DatabaseError};

/// Elapsed conversation time of one running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DurationSample {
    pub session_id: String,
    pub caller_ref: Option<String>,
    pub conversation_started_at: i64,
    pub elapsed_secs: i64,
}

/// Sample every session whose conversation has started and not ended.
pub async fn observe(db: &Database, now: i64) -> Result<Vec<DurationSample>, DatabaseError> {
    Ok(db
        .list_conversations()
        .await?
        .into_iter()
        .filter_map(|session| {
            let started = session.conversation_started_at?;
            Some(DurationSample {
                elapsed_secs: (now - started).max(0),
                conversation_started_at: started,
                caller_ref: session.caller_ref,
                session_id: session.id,
            })
        })
        .collect())
}

/// Log samples under the `warmpool::metering` target (and export them as a
/// duration histogram) until shutdown.
pub fn spawn_metering_task(
    db: Database,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match observe(&db, unix_timestamp()).await {
                        Ok(samples) => {
                            for sample in samples {
                                instruments::record_conversation_elapsed(sample.elapsed_secs);
                                info!(
                                    target: "warmpool::metering",
                                    session_id = %sample.session_id,
                                    caller_ref = ?sample.caller_ref,
                                    elapsed_secs = sample.elapsed_secs,
                                    "Conversation in progress"
                                );
                            }
                        }
                        Err(e) => warn!(error = %e, "Metering observation failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Metering task shutting down");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::{NewSession, SessionConfig};

    #[tokio::test]
    async fn samples_only_running_conversations() {
        let db = Database::open_in_memory().await.unwrap();
        let config = SessionConfig::default();
        for (id, caller) in [("talking", "call-1"), ("waiting", "call-2"), ("finished", "call-3")] {
            db.create_session(&NewSession {
                id,
                instance_id: "inst-a",
                pool_bound: false,
                caller_ref: Some(caller),
                config: &config,
                log_ref: "file:///tmp/x.log",
            })
            .await
            .unwrap();
            db.mark_ready(id, false).await.unwrap();
        }
        db.set_conversation_started("talking", 1_000).await.unwrap();
        db.set_conversation_started("finished", 1_000).await.unwrap();
        db.mark_ended("finished", "done").await.unwrap();

        let samples = observe(&db, 1_090).await.unwrap();
        assert_eq!(
            samples,
            vec![DurationSample {
                session_id: "talking".to_string(),
                caller_ref: Some("call-1".to_string()),
                conversation_started_at: 1_000,
                elapsed_secs: 90,
            }]
        );

        // Observation never writes.
        let session = db.get_session("talking").await.unwrap();
        assert_eq!(session.status, "ready");
    }
}
