//! State store models for the warmpool daemon.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// `session:<id>` record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub status: String,
    pub pid: Option<i64>,
    pub pgid: Option<i64>,
    /// Orchestrator instance whose spawn worker created the process group.
    pub instance_id: String,
    pub pool_bound: bool,
    pub owned: bool,
    pub caller_ref: Option<String>,
    pub voice_id: Option<String>,
    pub opening_line: Option<String>,
    pub system_prompt: Option<String>,
    pub log_ref: String,
    pub reason: Option<String>,
    pub failure_kind: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub assigned_at: Option<i64>,
    pub conversation_started_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl Session {
    /// Parsed status. Rows are constrained by a CHECK, so `None` means a
    /// foreign writer put garbage in the store.
    pub fn status(&self) -> Option<SessionStatus> {
        self.status.parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_some_and(SessionStatus::is_terminal)
    }

    /// Process group recorded for this session, if the spawn got that far.
    #[allow(clippy::cast_possible_truncation)]
    pub fn process_group(&self) -> Option<(i32, i32)> {
        Some((self.pid? as i32, self.pgid? as i32))
    }
}

/// `agent:<id>:pid` record: the durable half of a process group handle.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AgentPid {
    pub session_id: String,
    pub pid: i64,
    pub pgid: i64,
    pub instance_id: String,
    pub recorded_at: i64,
}

/// `pool:stats` counters plus the live pool size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_spawned: i64,
    pub total_assigned: i64,
    pub total_failed: i64,
    pub total_reaped: i64,
    pub pool_size: i64,
}

/// Named counters in `pool:stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolCounter {
    Spawned,
    Assigned,
    Failed,
    Reaped,
}

impl PoolCounter {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Spawned => "total_spawned",
            Self::Assigned => "total_assigned",
            Self::Failed => "total_failed",
            Self::Reaped => "total_reaped",
        }
    }
}

/// Caller-requested agent configuration. Opaque to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub voice_id: Option<String>,
    pub opening_line: Option<String>,
    pub system_prompt: Option<String>,
}

/// Session status.
///
/// `starting → ready → ended`, `starting → error`, `ready → error`,
/// `starting → ended` on explicit end. `error` and `ended` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Ready,
    Error,
    Ended,
}

impl SessionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Ended => "ended",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Ended)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            "ended" => Ok(Self::Ended),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Why a session landed in `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Agent did not signal readiness in time.
    SpawnTimeout,
    /// Process could not be created, or exited before signalling readiness.
    SpawnFailure,
    /// Liveness check found the agent gone.
    ProcessDied,
    /// `starting` record with no live spawn behind it.
    StartupStalled,
}

impl FailureKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SpawnTimeout => "spawn_timeout",
            Self::SpawnFailure => "spawn_failure",
            Self::ProcessDied => "process_died",
            Self::StartupStalled => "startup_stalled",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_its_own_strings() {
        for status in [
            SessionStatus::Starting,
            SessionStatus::Ready,
            SessionStatus::Error,
            SessionStatus::Ended,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("running".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn only_error_and_ended_are_terminal() {
        assert!(!SessionStatus::Starting.is_terminal());
        assert!(!SessionStatus::Ready.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(SessionStatus::Ended.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Ready).unwrap();
        assert_eq!(json, "\"ready\"");
        let json = serde_json::to_string(&FailureKind::ProcessDied).unwrap();
        assert_eq!(json, "\"process_died\"");
    }
}
