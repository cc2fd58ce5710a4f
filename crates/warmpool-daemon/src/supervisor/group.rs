//! Process group liveness and termination.
//!
//! Every agent leads its own process group, so all signals here target a
//! whole group. A pid or pgid that cannot be resolved counts as terminated.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::{Pid, getpgrp};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::SupervisorError;

/// Interval between liveness polls while waiting for a group to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for the kernel to tear a group down after SIGKILL.
const KILL_SETTLE: Duration = Duration::from_secs(1);

/// One live member of a process group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMember {
    pub pid: i32,
    pub ppid: i32,
    pub cmd: String,
}

/// How a group termination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    /// Nothing was left to signal.
    AlreadyTerminated,
    /// Every member exited within the grace window.
    Graceful,
    /// Survivors were killed after the grace window.
    Forced,
}

/// Whether `pid` names a running (non-zombie) process.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => !is_zombie(pid),
        // Exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether at least one running process reports `pgid` as its group.
pub fn is_group_alive(pgid: i32) -> bool {
    if pgid <= 0 {
        return false;
    }

    #[cfg(target_os = "linux")]
    {
        list_group_members(pgid).map_or_else(
            |_| signal_zero_reaches(pgid),
            |members| !members.is_empty(),
        )
    }

    #[cfg(not(target_os = "linux"))]
    {
        signal_zero_reaches(pgid)
    }
}

fn signal_zero_reaches(pgid: i32) -> bool {
    matches!(
        killpg(Pid::from_raw(pgid), None),
        Ok(()) | Err(Errno::EPERM)
    )
}

/// Running members of a process group.
#[cfg(target_os = "linux")]
pub fn list_group_members(pgid: i32) -> Result<Vec<GroupMember>, SupervisorError> {
    let processes = procfs::process::all_processes()
        .map_err(|e| SupervisorError::Listing(e.to_string()))?;

    let mut members = Vec::new();
    for process in processes {
        // Processes can vanish between the directory scan and the stat read.
        let Ok(process) = process else { continue };
        let Ok(stat) = process.stat() else { continue };
        if stat.pgrp != pgid || matches!(stat.state, 'Z' | 'X') {
            continue;
        }
        let cmd = process
            .cmdline()
            .ok()
            .filter(|args| !args.is_empty())
            .map_or_else(|| format!("[{}]", stat.comm), |args| args.join(" "));
        members.push(GroupMember {
            pid: stat.pid,
            ppid: stat.ppid,
            cmd,
        });
    }
    Ok(members)
}

#[cfg(not(target_os = "linux"))]
pub fn list_group_members(_pgid: i32) -> Result<Vec<GroupMember>, SupervisorError> {
    Err(SupervisorError::Listing(
        "process group listing requires procfs".to_string(),
    ))
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: i32) -> bool {
    procfs::process::Process::new(pid)
        .and_then(|p| p.stat())
        .is_ok_and(|stat| matches!(stat.state, 'Z' | 'X'))
}

#[cfg(not(target_os = "linux"))]
const fn is_zombie(_pid: i32) -> bool {
    false
}

/// Stop a whole process group: SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Refuses pgid ≤ 1 and the orchestrator's own group. Terminating a group
/// that is already gone succeeds with [`TerminationOutcome::AlreadyTerminated`].
pub async fn terminate_group(
    pgid: i32,
    grace: Duration,
) -> Result<TerminationOutcome, SupervisorError> {
    if pgid <= 1 || pgid == getpgrp().as_raw() {
        return Err(SupervisorError::RefusedGroup(pgid));
    }

    if !is_group_alive(pgid) {
        debug!(pgid, "Process group already gone");
        return Ok(TerminationOutcome::AlreadyTerminated);
    }

    match killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(TerminationOutcome::AlreadyTerminated),
        Err(source) => return Err(SupervisorError::Signal { pgid, source }),
    }

    if wait_for_exit(pgid, grace).await {
        info!(pgid, "Process group exited gracefully");
        return Ok(TerminationOutcome::Graceful);
    }

    warn!(pgid, grace_secs = grace.as_secs_f64(), "Grace window elapsed, killing process group");
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(source) => return Err(SupervisorError::Signal { pgid, source }),
    }

    if !wait_for_exit(pgid, KILL_SETTLE).await {
        warn!(pgid, "Process group still visible after SIGKILL");
    }
    Ok(TerminationOutcome::Forced)
}

/// Poll until the group is gone or `within` elapses. Returns whether it is gone.
async fn wait_for_exit(pgid: i32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if !is_group_alive(pgid) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}
