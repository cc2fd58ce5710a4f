//! State store handle.

pub use warmpool_core::db::DatabaseError;

warmpool_core::define_database!(Database, "State store migrations complete");
