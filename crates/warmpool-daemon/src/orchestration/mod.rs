//! Agent pool orchestration.
//!
//! - [`SpawnPool`]: bounded-concurrency spawn workers.
//! - [`PrewarmScheduler`]: keeps idle ready agents at the pool target.
//! - [`AssignmentService`]: hands agents to callers, from the pool or on demand.
//! - [`SessionLifecycle`]: explicit end, conversation start, shutdown.
//! - [`Reaper`]: liveness, ceilings, stalled spawns, retention.
//! - [`metering`]: read-only conversation duration samples.
//! - [`Orchestrator`]: wires the above together for one instance.

pub mod assign;
pub mod lifecycle;
pub mod metering;
pub mod orchestrator;
pub mod prewarm;
pub mod reaper;
pub mod spawner;

pub use assign::{Assignment, AssignmentService, LatencyClass};
pub use lifecycle::{EndOutcome, SessionLifecycle};
pub use orchestrator::Orchestrator;
pub use prewarm::{PrewarmReport, PrewarmScheduler};
pub use reaper::{PROCESS_DIED_REASON, ReapReport, Reaper};
pub use spawner::{SpawnError, SpawnOrder, SpawnPool, SpawnSettings, SubmitOutcome};

use crate::storage::DatabaseError;

/// Errors surfaced by orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("Unknown session: {0}")]
    UnknownSession(String),
}
