//! One orchestrator instance: the components wired to a shared state store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use warmpool_core::OrchestratorConfig;

use super::OrchestrationError;
use super::assign::AssignmentService;
use super::lifecycle::SessionLifecycle;
use super::metering::spawn_metering_task;
use super::prewarm::PrewarmScheduler;
use super::reaper::Reaper;
use super::spawner::{SpawnPool, SpawnSettings};
use crate::storage::Database;
use crate::supervisor::ProcessSupervisor;

pub struct Orchestrator {
    db: Database,
    instance_id: String,
    supervisor: Arc<ProcessSupervisor>,
    spawner: SpawnPool,
    prewarm: PrewarmScheduler,
    assignment: AssignmentService,
    lifecycle: SessionLifecycle,
    reaper: Reaper,
    reaper_interval: Duration,
    metering_interval: Duration,
}

impl Orchestrator {
    pub fn new(db: Database, config: &OrchestratorConfig, instance_id: String) -> Self {
        let lifecycle_config = &config.lifecycle;
        let supervisor = Arc::new(ProcessSupervisor::new(config.agent.clone()));

        let spawner = SpawnPool::new(
            db.clone(),
            Arc::clone(&supervisor),
            SpawnSettings {
                instance_id: instance_id.clone(),
                max_concurrent: config.pool.max_concurrent_spawns,
                log_dir: config.log_dir(),
                startup_timeout: lifecycle_config.startup_timeout(),
                grace: lifecycle_config.grace(),
            },
        );
        let prewarm = PrewarmScheduler::new(
            db.clone(),
            spawner.clone(),
            config.pool.target_size,
            Duration::from_secs(config.pool.prewarm_interval_secs),
        );
        let assignment =
            AssignmentService::new(db.clone(), spawner.clone(), Some(prewarm.nudger()));
        let lifecycle =
            SessionLifecycle::new(db.clone(), Arc::clone(&supervisor), lifecycle_config.grace());
        let reaper = Reaper::new(
            db.clone(),
            Arc::clone(&supervisor),
            lifecycle.clone(),
            lifecycle_config.clone(),
        );

        Self {
            db,
            instance_id,
            supervisor,
            spawner,
            prewarm,
            assignment,
            lifecycle,
            reaper,
            reaper_interval: Duration::from_secs(lifecycle_config.reaper_interval_secs),
            metering_interval: Duration::from_secs(lifecycle_config.metering_interval_secs),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub const fn db(&self) -> &Database {
        &self.db
    }

    pub const fn assignment(&self) -> &AssignmentService {
        &self.assignment
    }

    pub const fn lifecycle(&self) -> &SessionLifecycle {
        &self.lifecycle
    }

    pub const fn prewarm(&self) -> &PrewarmScheduler {
        &self.prewarm
    }

    pub const fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    pub const fn spawner(&self) -> &SpawnPool {
        &self.spawner
    }

    /// Reload handles of groups this instance spawned before a restart.
    pub async fn recover(&self) -> Result<usize, OrchestrationError> {
        let records = self.db.list_live_agent_pids(&self.instance_id).await?;
        Ok(self.supervisor.recover(&records).await)
    }

    /// Start the pre-warm, reaper and metering loops.
    pub fn start(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(instance_id = %self.instance_id, "Starting orchestrator loops");
        vec![
            self.prewarm.clone().spawn(shutdown.clone()),
            self.reaper
                .clone()
                .spawn(self.reaper_interval, shutdown.clone()),
            spawn_metering_task(self.db.clone(), self.metering_interval, shutdown.clone()),
        ]
    }

    /// Stop spawning, wait for in-flight spawns, then end every live session
    /// this instance spawned. Returns how many sessions were ended.
    pub async fn shutdown(&self) -> Result<usize, OrchestrationError> {
        self.spawner.close();
        self.spawner.drain().await;
        let ended = self.lifecycle.shutdown_owned(&self.instance_id).await?;
        info!(instance_id = %self.instance_id, ended, "Orchestrator shut down");
        Ok(ended)
    }
}
