//! Error types shared across the crate.

use thiserror::Error;

/// Errors surfaced by the durable stores (work queue and assignment ledger).
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("pool checkout failed: {0}")]
    PoolCheckout(#[from] deadpool_postgres::PoolError),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Errors raised while loading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {name}")]
    MissingVar { name: &'static str },

    #[error("invalid value for {name}: {message}")]
    Invalid { name: &'static str, message: String },
}
