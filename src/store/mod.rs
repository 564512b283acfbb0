//! Persistence layer: libSQL-backed storage for jobs, workers, outputs, and limiter state.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Finalized, Reclaimed, Store};
