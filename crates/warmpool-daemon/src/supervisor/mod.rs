//! Process supervisor for agent subprocesses.
//!
//! Spawns each agent as the leader of a fresh process group, waits for its
//! readiness handshake, and terminates whole groups on request.

mod group;
mod process;

use std::time::Duration;

pub use group::{
    GroupMember, TerminationOutcome, is_alive, is_group_alive, list_group_members,
    terminate_group,
};
pub use process::{AgentProcess, GroupHandle, ProcessSupervisor, ReadinessHandle, SpawnRequest};

/// Errors from process supervision.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn agent: {reason}")]
    SpawnFailed { reason: String },

    #[error("Agent did not signal readiness within {0:?}")]
    ReadinessTimeout(Duration),

    #[error("Agent exited before signalling readiness")]
    ExitedBeforeReady,

    #[error("Refusing to signal process group {0}")]
    RefusedGroup(i32),

    #[error("Failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("Process listing unavailable: {0}")]
    Listing(String),
}
