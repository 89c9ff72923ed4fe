//! SQLite-backed store for the rows the gateway reads and writes.
//!
//! The same database file is opened by the long-running `web` process and by
//! every short-lived `serv` and `hook` process git spawns, so the pool runs in
//! WAL mode with a busy timeout: sibling `update` hooks of one push insert
//! concurrently and must queue rather than fail.

pub mod actions;
pub mod error;
pub mod keys;
pub mod models;
pub mod repos;
pub mod tokens;
pub mod update_tasks;
pub mod users;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

pub use error::{Error, Result};
pub use models::{AuthorizedKey, Repository, UpdateTask, User};

use crate::config::DatabaseConfig;

const SCHEMA: &str = include_str!("schema.sql");

/// Database connection pool
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database described by `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            config.path.display()
        ))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Private in-memory database; a single connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Create all tables. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn users(&self) -> users::Users<'_> {
        users::Users::new(&self.pool)
    }

    pub fn tokens(&self) -> tokens::Tokens<'_> {
        tokens::Tokens::new(&self.pool)
    }

    pub fn repos(&self) -> repos::Repos<'_> {
        repos::Repos::new(&self.pool)
    }

    pub fn keys(&self) -> keys::Keys<'_> {
        keys::Keys::new(&self.pool)
    }

    pub fn update_tasks(&self) -> update_tasks::UpdateTasks<'_> {
        update_tasks::UpdateTasks::new(&self.pool)
    }

    pub fn actions(&self) -> actions::Actions<'_> {
        actions::Actions::new(&self.pool)
    }

    /// Cheap liveness probe used by the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
