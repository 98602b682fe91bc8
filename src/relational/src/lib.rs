pub mod adapter;
pub mod resolver;
pub mod tables;

pub use adapter::{PgExec, RelationalAdapter, RelationalReport, SqlExec};
pub use resolver::{PgLookup, ResolveStrategy, Resolver};

/// Errors from the relational store. Per-table errors are handled inside the
/// adapter; only total inability to obtain a usable connection reaches the
/// orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum RelationalError {
    #[error("database error: {0}")]
    Store(String),
    #[error("could not establish a connection: {0}")]
    Connect(String),
}

impl From<sqlx::Error> for RelationalError {
    fn from(e: sqlx::Error) -> Self {
        RelationalError::Store(e.to_string())
    }
}
