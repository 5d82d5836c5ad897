//! Persistence layer: libSQL-backed storage for contacts, conversations,
//! messages and scheduled sends.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{CancelOutcome, Store};
