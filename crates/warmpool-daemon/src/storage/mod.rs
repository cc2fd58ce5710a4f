//! `SQLite` state store for the warmpool daemon.
//!
//! Holds session records, the pre-warm pool set, pool counters, operator
//! settings and the durable process group records. Several orchestrator
//! instances may share one database file.

mod db;
mod models;
mod queries;
mod queries_pool;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use queries::{CreateOutcome, NewSession};
