//! Connection bootstrap and the registry opener for SQLite.
//!
//! # Responsibility
//! - Resolve a logical name plus settings into a file or shared in-memory target.
//! - Configure connection pragmas required by every pooled connection.
//! - Open whole pools on behalf of the registry.

use super::pool::SqlitePool;
use super::DbResult;
use crate::config::{ConnectionSettings, RegistryConfig};
use crate::registry::{Opener, Registry};
use log::{error, info};
use r2d2::CustomizeConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::time::{Duration, Instant};

/// Registry whose handles are SQLite pools.
pub type SqliteRegistry = Registry<SqliteOpener>;

/// Where the connections of one pool point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    File(String),
    /// Shared-cache in-memory database; all pools for the same name see the same data.
    SharedMemory(String),
}

impl ConnectionTarget {
    pub fn resolve(name: &str, settings: &ConnectionSettings) -> Self {
        match settings.path.as_deref() {
            Some(path) => Self::File(path.to_string()),
            None => Self::SharedMemory(format!(
                "file:connreg-{}?mode=memory&cache=shared",
                sanitize_memory_name(name)
            )),
        }
    }

    pub(super) fn manager(&self) -> SqliteConnectionManager {
        match self {
            Self::File(path) => SqliteConnectionManager::file(path),
            Self::SharedMemory(uri) => SqliteConnectionManager::file(uri).with_flags(
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
        }
    }
}

/// Pragmas applied to every connection the pool establishes.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionPragmas {
    pub busy_timeout: Duration,
}

impl ConnectionPragmas {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            busy_timeout: Duration::from_millis(settings.busy_timeout_ms),
        }
    }
}

impl CustomizeConnection<Connection, rusqlite::Error> for ConnectionPragmas {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(self.busy_timeout)?;
        // Reading the header forces the backing file to actually open.
        conn.query_row("PRAGMA schema_version;", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

fn sanitize_memory_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Opens a fresh [`SqlitePool`] per call, using the settings configured for each name.
#[derive(Debug, Clone, Default)]
pub struct SqliteOpener {
    config: RegistryConfig,
}

impl SqliteOpener {
    pub fn new(config: RegistryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Builds a registry using the configured retry policy and default name.
    pub fn into_registry(self) -> SqliteRegistry {
        let retry = self.config.retry;
        let default_name = self.config.default_name.clone();
        Registry::with_retry_policy(self, retry).with_default_name(default_name)
    }
}

impl Opener for SqliteOpener {
    type Handle = SqlitePool;
    type Error = super::DbError;

    fn open(&self, name: &str) -> DbResult<SqlitePool> {
        let started_at = Instant::now();
        let settings = self.config.settings_for(name);
        info!("event=db_open module=db status=start name={}", name);

        match SqlitePool::open(name, settings) {
            Ok(pool) => {
                info!(
                    "event=db_open module=db status=ok name={} pool_id={} duration_ms={}",
                    name,
                    pool.id(),
                    started_at.elapsed().as_millis()
                );
                Ok(pool)
            }
            Err(err) => {
                error!(
                    "event=db_open module=db status=error name={} duration_ms={} error_code=db_open_failed error={}",
                    name,
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }
}
