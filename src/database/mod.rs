//! SQLite-backed durable store shared by every compliance component.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::config::ComplianceConfig;
use crate::error::{ComplianceError, ComplianceResult};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    timeout: Duration,
}

impl Database {
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        timeout: Duration,
    ) -> ComplianceResult<Self> {
        Self::open(database_url, max_connections, timeout, true).await
    }

    /// Like `new`, but fails instead of creating a missing database file.
    pub async fn open_existing(
        database_url: &str,
        max_connections: u32,
        timeout: Duration,
    ) -> ComplianceResult<Self> {
        Self::open(database_url, max_connections, timeout, false).await
    }

    async fn open(
        database_url: &str,
        max_connections: u32,
        timeout: Duration,
        create: bool,
    ) -> ComplianceResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| ComplianceError::ConfigError(format!("Invalid database URL: {}", e)))?
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(timeout)
            .foreign_keys(true);

        // Every connection to ":memory:" is its own database.
        let in_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new()
            .acquire_timeout(timeout)
            .max_connections(if in_memory { 1 } else { max_connections });
        if in_memory {
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        info!("Connected to {}", database_url);
        Ok(Database { pool, timeout })
    }

    pub async fn connect(config: &ComplianceConfig) -> ComplianceResult<Self> {
        let database = Self::new(
            &config.database_url,
            config.database_max_connections,
            config.store_timeout(),
        )
        .await?;
        database.run_migrations().await?;
        Ok(database)
    }

    /// Migrated single-connection in-memory database.
    pub async fn new_in_memory() -> ComplianceResult<Self> {
        let database = Self::new("sqlite::memory:", 1, DEFAULT_TIMEOUT).await?;
        database.run_migrations().await?;
        Ok(database)
    }

    pub async fn run_migrations(&self) -> ComplianceResult<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| ComplianceError::DatabaseError(format!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a store operation under the configured timeout.
    pub async fn bounded<T, F>(&self, operation: F) -> ComplianceResult<T>
    where
        F: Future<Output = ComplianceResult<T>>,
    {
        tokio::time::timeout(self.timeout, operation).await?
    }
}

/// Current time at the precision the store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 form; lexical order matches time order.
pub fn encode_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_time(raw: &str) -> ComplianceResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ComplianceError::DatabaseError(format!("Invalid stored timestamp {}: {}", raw, e)))
}

pub fn decode_optional_time(raw: Option<String>) -> ComplianceResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(decode_time).transpose()
}
