//! Connection settings for the backing PostgreSQL database.
//!
//! One database hosts every queue: `create_queue` lays each queue's table
//! group down in the `mule` schema at runtime, so there is no per-queue
//! configuration here. What remains is how to reach the database and how
//! large the pool shared by all queues should be.

use std::env;
use std::time::Duration;

/// Where the task store lives and how connections to it are pooled.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL connection URL, e.g. `postgresql://localhost:5432/mule`.
    pub database_url: String,
    /// Upper bound on pooled connections, shared across every queue and
    /// worker in the process.
    pub max_connections: u32,
    /// How long to wait for a pooled connection before giving up.
    pub acquire_timeout: Duration,
}

impl DbConfig {
    /// Fallback URL when `MULE_DATABASE_URL` is unset.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/mule";

    const DEFAULT_POOL_SIZE: u32 = 5;
    const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Read the environment: `MULE_DATABASE_URL` for the URL and
    /// `MULE_POOL_SIZE` for the connection bound. Anything unset or
    /// unparseable falls back to the defaults.
    pub fn from_env() -> Self {
        let database_url =
            env::var("MULE_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        let max_connections = env::var("MULE_POOL_SIZE")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .filter(|&size| size > 0)
            .unwrap_or(Self::DEFAULT_POOL_SIZE);
        Self {
            database_url,
            max_connections,
            acquire_timeout: Self::DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Point at an explicit URL, keeping the default pool settings.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: Self::DEFAULT_POOL_SIZE,
            acquire_timeout: Self::DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Adjust the pool bound. Workers with high `concurrency` want this
    /// raised, since every in-flight run issues its own statements.
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Split the URL into its server half and the database name:
    /// `postgresql://host:5432/mule` becomes
    /// `("postgresql://host:5432", "mule")`.
    ///
    /// Returns `None` when the URL carries no database path.
    pub fn split_database(&self) -> Option<(&str, &str)> {
        let url = self.database_url.as_str();
        let scheme_end = url.find("://").map(|at| at + 3)?;
        let slash = url[scheme_end..].rfind('/')?;
        let split_at = scheme_end + slash;
        let name = &url[split_at + 1..];
        if name.is_empty() {
            return None;
        }
        Some((&url[..split_at], name))
    }

    /// URL of the `postgres` maintenance database on the same server.
    ///
    /// Bootstrap needs it: `CREATE DATABASE` has to be issued from a
    /// connection outside the database being created. URLs that cannot
    /// be split are returned unchanged.
    pub fn maintenance_url(&self) -> String {
        match self.split_database() {
            Some((server, _)) => format!("{server}/postgres"),
            None => self.database_url.clone(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
