//! Configuration resolution for warmpool.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Config file (`~/.warmpool/config.toml` or an explicit path)
//! 3. Environment variables (`WARMPOOL_*`)
//! 4. CLI arguments (highest priority, applied by the daemon binary)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

/// Daemon-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// State store location. `None` resolves to `~/.warmpool/state.db`.
    pub database_path: Option<PathBuf>,
    /// Stable identity of this orchestrator instance. `None` generates one per run.
    pub instance_id: Option<String>,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            instance_id: None,
            log_level: "info".to_string(),
        }
    }
}

/// How agent subprocesses are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable.
    pub program: PathBuf,
    /// Arguments passed to every agent.
    pub args: Vec<String>,
    /// Line the agent prints on stdout once it is ready to serve.
    pub ready_sentinel: String,
    /// Directory for per-session log sinks. `None` resolves to `~/.warmpool/logs`.
    pub log_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("warmpool-agent"),
            args: Vec::new(),
            ready_sentinel: "READY".to_string(),
            log_dir: None,
        }
    }
}

/// Pre-warm pool and spawn worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum simultaneous spawns per instance.
    pub max_concurrent_spawns: usize,
    /// Pool target used until an operator stores one in the state store.
    pub target_size: u32,
    pub prewarm_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_spawns: 4,
            target_size: 2,
            prewarm_interval_secs: 30,
        }
    }
}

/// Session lifecycle limits enforced by the spawn workers and the reaper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Bound on the readiness handshake.
    pub startup_timeout_secs: u64,
    /// Wait between SIGTERM and SIGKILL on group termination.
    pub grace_secs: u64,
    /// Owned session that never started a conversation.
    pub idle_timeout_secs: u64,
    /// Unassigned pool member.
    pub pool_idle_timeout_secs: u64,
    /// Ceiling measured from the conversation start.
    pub max_conversation_secs: u64,
    /// How long terminal records are kept before being purged.
    pub retention_secs: u64,
    pub reaper_interval_secs: u64,
    pub metering_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            startup_timeout_secs: 20,
            grace_secs: 5,
            idle_timeout_secs: 10 * 60,
            pool_idle_timeout_secs: 60 * 60,
            max_conversation_secs: 30 * 60,
            retention_secs: 60 * 60,
            reaper_interval_secs: 60,
            metering_interval_secs: 60,
        }
    }
}

impl LifecycleConfig {
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub const fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

impl OrchestratorConfig {
    /// Check invariants the orchestrator relies on.
    pub fn validate(&self) -> Result<()> {
        if self.agent.program.as_os_str().is_empty() {
            return Err(Error::Config("agent.program must not be empty".to_string()));
        }
        if self.agent.ready_sentinel.trim().is_empty() {
            return Err(Error::Config(
                "agent.ready_sentinel must not be blank".to_string(),
            ));
        }
        if self.pool.max_concurrent_spawns == 0 {
            return Err(Error::Config(
                "pool.max_concurrent_spawns must be at least 1".to_string(),
            ));
        }
        let intervals = [
            ("pool.prewarm_interval_secs", self.pool.prewarm_interval_secs),
            (
                "lifecycle.reaper_interval_secs",
                self.lifecycle.reaper_interval_secs,
            ),
            (
                "lifecycle.metering_interval_secs",
                self.lifecycle.metering_interval_secs,
            ),
            (
                "lifecycle.startup_timeout_secs",
                self.lifecycle.startup_timeout_secs,
            ),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// Resolved state store path.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.daemon
            .database_path
            .clone()
            .or_else(|| base_dir().map(|d| d.join("state.db")))
    }

    /// Resolved log sink directory.
    pub fn log_dir(&self) -> PathBuf {
        self.agent
            .log_dir
            .clone()
            .or_else(|| base_dir().map(|d| d.join("logs")))
            .unwrap_or_else(|| std::env::temp_dir().join("warmpool-logs"))
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `path` must exist; the default location is optional.
pub fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let mut config = match path {
        Some(p) => load_config_file(p)?,
        None => match default_config_path() {
            Some(p) if p.exists() => load_config_file(&p)?,
            _ => OrchestratorConfig::default(),
        },
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// `~/.warmpool`
pub fn base_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".warmpool"))
}

/// Default config file location: `~/.warmpool/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    base_dir().map(|d| d.join("config.toml"))
}

fn load_config_file(path: &Path) -> Result<OrchestratorConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    Ok(toml::from_str(&content)?)
}

fn apply_env_overrides(config: &mut OrchestratorConfig) {
    if let Ok(val) = std::env::var("WARMPOOL_AGENT_PROGRAM") {
        config.agent.program = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("WARMPOOL_DB_PATH") {
        config.daemon.database_path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("WARMPOOL_INSTANCE_ID") {
        config.daemon.instance_id = Some(val);
    }
    if let Ok(val) = std::env::var("WARMPOOL_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Ok(val) = std::env::var("WARMPOOL_POOL_TARGET")
        && let Ok(n) = val.parse()
    {
        config.pool.target_size = n;
    }
    if let Ok(val) = std::env::var("WARMPOOL_MAX_SPAWNS")
        && let Ok(n) = val.parse()
    {
        config.pool.max_concurrent_spawns = n;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.prewarm_interval_secs, 30);
        assert_eq!(config.lifecycle.reaper_interval_secs, 60);
        assert_eq!(config.lifecycle.max_conversation_secs, 30 * 60);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [agent]
            program = "/usr/bin/voice-agent"
            args = ["--realtime"]

            [pool]
            target_size = 5
            "#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.agent.program, PathBuf::from("/usr/bin/voice-agent"));
        assert_eq!(config.agent.args, vec!["--realtime"]);
        assert_eq!(config.agent.ready_sentinel, "READY");
        assert_eq!(config.pool.target_size, 5);
        assert_eq!(config.pool.max_concurrent_spawns, 4);
        assert_eq!(config.lifecycle.grace_secs, 5);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = load_config(Some(Path::new("/nonexistent/warmpool.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn malformed_file_is_a_toml_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pool\ntarget_size = ").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Toml(_))));
    }

    #[test]
    fn zero_spawn_concurrency_rejected() {
        let mut config = OrchestratorConfig::default();
        config.pool.max_concurrent_spawns = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_concurrent_spawns"), "{err}");
    }

    #[test]
    fn zero_interval_rejected() {
        let mut config = OrchestratorConfig::default();
        config.lifecycle.reaper_interval_secs = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("reaper_interval_secs"), "{err}");
    }

    #[test]
    fn explicit_log_dir_wins() {
        let mut config = OrchestratorConfig::default();
        config.agent.log_dir = Some(PathBuf::from("/var/log/warmpool"));
        assert_eq!(config.log_dir(), PathBuf::from("/var/log/warmpool"));
    }
}
