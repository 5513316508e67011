//! SQLite store behind the withdrawal request repository.
//!
//! The withdrawals agent keeps one row per request it has seen on chain. A
//! file path keeps the queue across restarts; `:memory:` rebuilds it from the
//! replayed queue logs on every start.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

/// Path that selects a process-lifetime in-memory store.
pub const IN_MEMORY: &str = ":memory:";

/// Connections to the withdrawal request store, shared by the repository
/// handles of every agent.
#[derive(Clone)]
pub struct DbPool {
    pool: SqlitePool,
}

impl DbPool {
    /// Open the withdrawal request store.
    ///
    /// # Arguments
    /// * `db_path` - SQLite file, created if missing, or `:memory:`
    ///
    /// # Returns
    /// The pool; the schema is applied separately by [`DbPool::migrate`].
    pub async fn new(db_path: &str) -> Result<Self> {
        if db_path == IN_MEMORY {
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(db_path)
            .with_context(|| format!("Invalid withdrawals store path {}", db_path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // One writer at a time; readers are the per-block queue checks.
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        info!("Opened withdrawals store at {}", db_path);
        Ok(Self { pool })
    }

    /// Open a private in-memory store.
    ///
    /// Every SQLite connection to `:memory:` opens its own database, so the
    /// pool holds exactly one connection and never lets it expire.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str(IN_MEMORY)?;

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        info!("Opened in-memory withdrawals store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the `withdrawal_requests` table if it does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Withdrawals store migration failed")?;
        info!("Withdrawals store schema is up to date");
        Ok(())
    }
}
