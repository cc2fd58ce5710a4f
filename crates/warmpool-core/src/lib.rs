//! `warmpool` Core Library
//!
//! Shared functionality for `warmpool` components:
//! - Orchestrator configuration resolution and validation
//! - `SQLite` state store plumbing (pool creation, migrations macro)
//! - Tracing/logging initialisation and pool instruments
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod instruments;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tracing_init;

pub use config::OrchestratorConfig;
pub use error::{Error, Result};
