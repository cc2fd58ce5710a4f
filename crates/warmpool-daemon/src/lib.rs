//! Warmpool Daemon Library
//!
//! Core functionality for the agent pool orchestrator:
//! - SQLite state store shared by every orchestrator instance
//! - Process supervision of agents as process group leaders
//! - Spawn worker pool, pre-warm scheduler and assignment service
//! - Health and reaper loop with read-only duration metering

pub mod orchestration;
pub mod storage;
pub mod supervisor;
