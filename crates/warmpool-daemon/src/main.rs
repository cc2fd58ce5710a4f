//! Warmpool Daemon
//!
//! Keeps a pool of pre-warmed agent processes, hands them to callers, and
//! reclaims them when sessions end, die or run past their limits.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use warmpool_core::OrchestratorConfig;
use warmpool_daemon::orchestration::Orchestrator;
use warmpool_daemon::storage::Database;
use warmpool_daemon::supervisor::list_group_members;

#[derive(Parser, Debug)]
#[command(name = "warmpool-daemon")]
#[command(version, about = "warmpool daemon - pre-warmed agent pool orchestrator")]
struct Args {
    /// Config file (default: ~/.warmpool/config.toml if present)
    #[arg(long, global = true, env = "WARMPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// State store file path
    #[arg(long, global = true, env = "WARMPOOL_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, global = true, env = "WARMPOOL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "WARMPOOL_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, global = true, env = "WARMPOOL_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the spawn pool, pre-warm scheduler, reaper and metering loops
    Serve {
        /// Agent executable
        #[arg(long, env = "WARMPOOL_AGENT_PROGRAM")]
        agent_program: Option<PathBuf>,
        /// Stable identity of this instance (enables restart recovery)
        #[arg(long, env = "WARMPOOL_INSTANCE_ID")]
        instance_id: Option<String>,
        /// Default pool target when none is stored
        #[arg(long, env = "WARMPOOL_POOL_TARGET")]
        pool_target: Option<u32>,
        /// Maximum simultaneous spawns
        #[arg(long, env = "WARMPOOL_MAX_SPAWNS")]
        max_spawns: Option<usize>,
    },
    /// Print a session record and its live process group as JSON
    Status {
        /// Session ID
        id: String,
    },
    /// End a session and terminate its process group
    End {
        /// Session ID
        id: String,
        /// Reason recorded on the session
        #[arg(long, default_value = "ended by operator")]
        reason: String,
    },
    /// Record the first realtime participant join for a session
    Join {
        /// Session ID
        id: String,
    },
    /// Show or set the runtime pool target shared by all instances
    PoolTarget {
        /// New target size
        size: Option<u32>,
    },
    /// Print pool counters and current pool size
    Stats,
}

// jscpd:ignore-start -- binary bootstrap is inherently similar across daemons
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = warmpool_core::config::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(path) = &args.db_path {
        config.daemon.database_path = Some(path.clone());
    }
    if let Some(level) = &args.log_level {
        config.daemon.log_level.clone_from(level);
    }

    #[cfg(feature = "metrics")]
    let metrics_endpoint = args.metrics_endpoint.as_deref();
    #[cfg(not(feature = "metrics"))]
    let metrics_endpoint: Option<&str> = None;

    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    let log_filter = format!("warmpool_daemon={0},warmpool={0}", config.daemon.log_level);
    let _metrics_guard = warmpool_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        args.log_json,
        metrics_endpoint,
    );
    // jscpd:ignore-end

    let db_path = config
        .database_path()
        .ok_or_else(|| anyhow::anyhow!("Cannot determine home directory; pass --db-path"))?;

    match args.command {
        Command::Serve {
            agent_program,
            instance_id,
            pool_target,
            max_spawns,
        } => {
            if let Some(program) = agent_program {
                config.agent.program = program;
            }
            if let Some(id) = instance_id {
                config.daemon.instance_id = Some(id);
            }
            if let Some(target) = pool_target {
                config.pool.target_size = target;
            }
            if let Some(n) = max_spawns {
                config.pool.max_concurrent_spawns = n;
            }
            config.validate().context("Invalid configuration")?;
            serve(config, &db_path).await
        }
        command => {
            let db = Database::open(&db_path)
                .await
                .with_context(|| format!("Failed to open state store {}", db_path.display()))?;
            run_operator_command(command, db, &config).await
        }
    }
}

async fn serve(config: OrchestratorConfig, db_path: &std::path::Path) -> anyhow::Result<()> {
    let instance_id = config
        .daemon
        .instance_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        instance_id = %instance_id,
        db = %db_path.display(),
        agent = %config.agent.program.display(),
        max_spawns = config.pool.max_concurrent_spawns,
        "Starting warmpool-daemon"
    );

    let db = Database::open(db_path).await?;
    let orchestrator = Orchestrator::new(db, &config, instance_id);

    let recovered = orchestrator.recover().await?;
    if recovered > 0 {
        info!(recovered, "Resumed supervision of agents from a previous run");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let loops = orchestrator.start(&shutdown_rx);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // The `true` parameter unsets $NOTIFY_SOCKET so agents don't
    // accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!("Orchestrator ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    for handle in loops {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task panicked");
        }
    }

    orchestrator.shutdown().await?;
    info!("Daemon stopped");
    Ok(())
}

/// One-shot commands against the shared state store.
///
/// User-facing output uses writeln! to stdout (this is a CLI, not debug output).
async fn run_operator_command(
    command: Command,
    db: Database,
    config: &OrchestratorConfig,
) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    match command {
        Command::Status { id } => {
            let session = db.get_session(&id).await?;
            let members = match session.process_group() {
                Some((_, pgid)) if !session.is_terminal() => {
                    list_group_members(pgid).unwrap_or_default()
                }
                _ => Vec::new(),
            };
            let report = serde_json::json!({
                "session": session,
                "group_members": members,
            });
            writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
        }
        Command::End { id, reason } => {
            // Ending from a separate process: no in-memory handles, the
            // recorded group is used.
            let orchestrator = Orchestrator::new(db, config, "operator".to_string());
            let outcome = orchestrator.lifecycle().end_session(&id, &reason).await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&outcome)?)?;
        }
        Command::Join { id } => {
            let orchestrator = Orchestrator::new(db, config, "operator".to_string());
            let started = orchestrator.lifecycle().mark_conversation_started(&id).await?;
            if started {
                writeln!(out, "Conversation started for {id}")?;
            } else {
                writeln!(out, "Conversation already started (or session not ready): {id}")?;
            }
        }
        Command::PoolTarget { size: Some(size) } => {
            db.set_pool_target(size).await?;
            writeln!(out, "Pool target set to {size}")?;
        }
        Command::PoolTarget { size: None } => {
            let stored = db.pool_target().await?;
            match stored {
                Some(target) => writeln!(out, "{target}")?,
                None => writeln!(out, "{} (default)", config.pool.target_size)?,
            }
        }
        Command::Stats => {
            let stats = db.pool_stats().await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&stats)?)?;
        }
        Command::Serve { .. } => anyhow::bail!("serve is not a one-shot command"),
    }
    Ok(())
}
