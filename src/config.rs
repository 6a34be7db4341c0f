//! Configuration loaded from the environment.
//!
//! The binary calls `dotenvy::dotenv()` before reading any of these, so a
//! local `.env` file works the same as real environment variables.

use crate::error::ConfigError;

const DEFAULT_POOL_SIZE: usize = 8;

/// Connection settings for the durable store.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    url: String,
    /// Maximum number of pooled connections.
    pub pool_size: usize,
}

impl DatabaseConfig {
    /// Create a config with the default pool size.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    /// Read `DATABASE_URL` (required) and `FOREMAN_DB_POOL_SIZE` (optional).
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingVar {
            name: "DATABASE_URL",
        })?;

        let pool_size = match std::env::var("FOREMAN_DB_POOL_SIZE") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "FOREMAN_DB_POOL_SIZE",
                message: format!("expected a positive integer, got {:?}", raw),
            })?,
            Err(_) => DEFAULT_POOL_SIZE,
        };

        Ok(Self { url, pool_size })
    }

    /// The connection URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Override the pool size.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }
}
