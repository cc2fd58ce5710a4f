//! Agent subprocess spawning and the in-memory process group handle table.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info, warn};
use warmpool_core::config::AgentConfig;

use super::SupervisorError;
use crate::storage::{AgentPid, SessionConfig};

/// pid/pgid pair of an agent's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupHandle {
    pub pid: i32,
    pub pgid: i32,
}

/// What to launch.
#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest<'a> {
    pub session_id: &'a str,
    pub config: &'a SessionConfig,
    pub log_ref: &'a str,
}

/// A freshly spawned agent.
#[derive(Debug)]
pub struct AgentProcess {
    pub pid: i32,
    pub pgid: i32,
    pub readiness: ReadinessHandle,
}

/// Resolves once the agent prints its ready sentinel.
#[derive(Debug)]
pub struct ReadinessHandle {
    rx: oneshot::Receiver<()>,
}

impl ReadinessHandle {
    /// Wait for the handshake, bounded by `timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<(), SupervisorError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(())) => Ok(()),
            // Sender dropped: stdout closed before the sentinel.
            Ok(Err(_)) => Err(SupervisorError::ExitedBeforeReady),
            Err(_) => Err(SupervisorError::ReadinessTimeout(timeout)),
        }
    }
}

/// Launches agents as process group leaders and remembers their groups.
pub struct ProcessSupervisor {
    agent: AgentConfig,
    /// Groups spawned (or recovered) by this instance, keyed by session id.
    handles: Arc<RwLock<HashMap<String, GroupHandle>>>,
}

impl ProcessSupervisor {
    pub fn new(agent: AgentConfig) -> Self {
        Self {
            agent,
            handles: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawn an agent leading a fresh process group (pgid == pid).
    pub async fn spawn(&self, request: SpawnRequest<'_>) -> Result<AgentProcess, SupervisorError> {
        let mut cmd = Command::new(&self.agent.program);
        cmd.args(&self.agent.args)
            .env("WARMPOOL_SESSION_ID", request.session_id)
            .env("WARMPOOL_LOG_REF", request.log_ref)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        // The daemon may run under systemd with a stripped environment.
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", &home);
        }
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", &path);
        }

        let config = request.config;
        if let Some(voice) = &config.voice_id {
            cmd.env("WARMPOOL_VOICE_ID", voice);
        }
        if let Some(line) = &config.opening_line {
            cmd.env("WARMPOOL_OPENING_LINE", line);
        }
        if let Some(prompt) = &config.system_prompt {
            cmd.env("WARMPOOL_SYSTEM_PROMPT", prompt);
        }

        info!(
            session_id = request.session_id,
            program = %self.agent.program.display(),
            "Spawning agent"
        );
        let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            reason: e.to_string(),
        })?;

        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or_else(|| SupervisorError::SpawnFailed {
                reason: "agent exited before its pid could be read".to_string(),
            })?;
        let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(pid)))
            .map_or(pid, nix::unistd::Pid::as_raw);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::SpawnFailed {
                reason: "Failed to capture stdout".to_string(),
            })?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let sentinel = self.agent.ready_sentinel.clone();
        let sid = request.session_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut ready_tx = Some(ready_tx);
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim() == sentinel
                    && let Some(tx) = ready_tx.take()
                {
                    debug!(session_id = %sid, "Agent signalled readiness");
                    let _ = tx.send(());
                    continue;
                }
                debug!(session_id = %sid, "stdout: {}", line);
            }
            debug!(session_id = %sid, "stdout reader finished");
        });

        if let Some(stderr) = child.stderr.take() {
            let sid = request.session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(session_id = %sid, "stderr: {}", line);
                }
            });
        }

        // Reap the leader as soon as it exits so it never lingers as a zombie.
        let sid = request.session_id.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(session_id = %sid, pid, ?status, "Agent leader exited"),
                Err(e) => warn!(session_id = %sid, pid, error = %e, "Failed to wait on agent"),
            }
        });

        self.handles
            .write()
            .await
            .insert(request.session_id.to_string(), GroupHandle { pid, pgid });

        Ok(AgentProcess {
            pid,
            pgid,
            readiness: ReadinessHandle { rx: ready_rx },
        })
    }

    /// Handle for a session spawned or recovered by this instance.
    pub async fn handle(&self, session_id: &str) -> Option<GroupHandle> {
        self.handles.read().await.get(session_id).copied()
    }

    /// Drop the handle once the group has been terminated.
    pub async fn forget(&self, session_id: &str) -> Option<GroupHandle> {
        self.handles.write().await.remove(session_id)
    }

    /// Session ids with a tracked group.
    pub async fn tracked(&self) -> Vec<String> {
        self.handles.read().await.keys().cloned().collect()
    }

    /// Rebuild the handle table from durable pid records after a restart.
    ///
    /// Returns the number of handles restored.
    pub async fn recover(&self, records: &[AgentPid]) -> usize {
        let mut handles = self.handles.write().await;
        let mut restored = 0;
        for record in records {
            let (Ok(pid), Ok(pgid)) = (i32::try_from(record.pid), i32::try_from(record.pgid))
            else {
                warn!(session_id = %record.session_id, "Ignoring out-of-range pid record");
                continue;
            };
            handles.insert(record.session_id.clone(), GroupHandle { pid, pgid });
            restored += 1;
        }
        drop(handles);
        info!(restored, "Recovered process group handles");
        restored
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::supervisor::{TerminationOutcome, is_alive, is_group_alive, terminate_group};

    fn shell(script: &str) -> ProcessSupervisor {
        ProcessSupervisor::new(AgentConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            ready_sentinel: "READY".to_string(),
            log_dir: None,
        })
    }

    fn request<'a>(id: &'a str, config: &'a SessionConfig) -> SpawnRequest<'a> {
        SpawnRequest {
            session_id: id,
            config,
            log_ref: "file:///tmp/test.log",
        }
    }

    #[tokio::test]
    async fn agent_leads_its_own_group() {
        let supervisor = shell("echo READY; sleep 30 & wait");
        let config = SessionConfig::default();
        let agent = supervisor.spawn(request("s-1", &config)).await.unwrap();

        assert_eq!(agent.pid, agent.pgid);
        agent.readiness.wait(Duration::from_secs(5)).await.unwrap();
        assert!(is_alive(agent.pid));
        assert!(is_group_alive(agent.pgid));
        assert_eq!(
            supervisor.handle("s-1").await,
            Some(GroupHandle {
                pid: agent.pid,
                pgid: agent.pgid
            })
        );

        let outcome = terminate_group(agent.pgid, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome, TerminationOutcome::Graceful);
        assert!(!is_group_alive(agent.pgid));
    }

    #[tokio::test]
    async fn session_config_reaches_the_agent() {
        let supervisor = shell(
            r#"[ "$WARMPOOL_VOICE_ID" = "alloy" ] && [ "$WARMPOOL_SESSION_ID" = "s-env" ] && echo READY; sleep 30"#,
        );
        let config = SessionConfig {
            voice_id: Some("alloy".into()),
            ..SessionConfig::default()
        };
        let agent = supervisor.spawn(request("s-env", &config)).await.unwrap();
        agent.readiness.wait(Duration::from_secs(5)).await.unwrap();
        terminate_group(agent.pgid, Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn exit_before_sentinel_fails_handshake() {
        let supervisor = shell("echo starting; exit 3");
        let config = SessionConfig::default();
        let agent = supervisor.spawn(request("s-2", &config)).await.unwrap();
        let err = agent
            .readiness
            .wait(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ExitedBeforeReady), "{err}");
    }

    #[tokio::test]
    async fn silent_agent_times_out() {
        let supervisor = shell("sleep 30");
        let config = SessionConfig::default();
        let agent = supervisor.spawn(request("s-3", &config)).await.unwrap();
        let err = agent
            .readiness
            .wait(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ReadinessTimeout(_)), "{err}");
        terminate_group(agent.pgid, Duration::from_secs(2)).await.unwrap();
        assert!(!is_group_alive(agent.pgid));
    }

    #[tokio::test]
    async fn stubborn_group_is_forced() {
        let supervisor = shell("trap '' TERM; echo READY; while :; do sleep 1; done");
        let config = SessionConfig::default();
        let agent = supervisor.spawn(request("s-4", &config)).await.unwrap();
        agent.readiness.wait(Duration::from_secs(5)).await.unwrap();

        let outcome = terminate_group(agent.pgid, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, TerminationOutcome::Forced);
        assert!(!is_group_alive(agent.pgid));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let supervisor = ProcessSupervisor::new(AgentConfig {
            program: PathBuf::from("/nonexistent/warmpool-agent"),
            ..AgentConfig::default()
        });
        let config = SessionConfig::default();
        let err = supervisor
            .spawn(request("s-5", &config))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed { .. }), "{err}");
        assert!(supervisor.handle("s-5").await.is_none());
    }

    #[tokio::test]
    async fn recover_restores_handles() {
        let supervisor = shell("true");
        let records = vec![AgentPid {
            session_id: "s-old".to_string(),
            pid: 1234,
            pgid: 1234,
            instance_id: "inst-a".to_string(),
            recorded_at: 0,
        }];
        assert_eq!(supervisor.recover(&records).await, 1);
        assert_eq!(
            supervisor.handle("s-old").await,
            Some(GroupHandle {
                pid: 1234,
                pgid: 1234
            })
        );
        assert!(supervisor.forget("s-old").await.is_some());
        assert!(supervisor.tracked().await.is_empty());
    }
}
