//! Persistence layer: libSQL-backed storage for scrape jobs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlJobStore;
pub use traits::JobStore;
