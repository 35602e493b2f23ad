//! `r2d2` pool of SQLite connections used as a registry handle.
//!
//! # Invariants
//! - At most `max_open_conns` connections exist; checkouts beyond that wait up to
//!   `connection_timeout_ms` for one to be returned.
//! - The pool keeps `max_idle_conns` connections warm.
//! - After `close()` no connection is handed out; checked-out ones are released
//!   when their guards drop.

use super::open::{ConnectionPragmas, ConnectionTarget};
use super::{DbError, DbResult};
use crate::config::ConnectionSettings;
use crate::registry::Closeable;
use log::debug;
use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::time::Duration;
use uuid::Uuid;

/// Checked-out connection; returns to its pool on drop.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Live set of pooled connections to one logical database.
#[derive(Debug)]
pub struct SqlitePool {
    id: Uuid,
    name: String,
    settings: ConnectionSettings,
    inner: Mutex<Option<Pool<SqliteConnectionManager>>>,
}

impl SqlitePool {
    /// Builds the pool and verifies that one connection can be established.
    ///
    /// # Errors
    /// - Returns the pool error when no connection can be opened within
    ///   `connection_timeout_ms`.
    pub fn open(name: &str, settings: ConnectionSettings) -> DbResult<Self> {
        let target = ConnectionTarget::resolve(name, &settings);
        let max_size = settings.max_open_conns.max(1);
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(settings.max_idle_conns.min(max_size)))
            .connection_timeout(Duration::from_millis(settings.connection_timeout_ms.max(1)))
            .connection_customizer(Box::new(ConnectionPragmas::from_settings(&settings)))
            .build(target.manager())?;
        // `min_idle` may be zero, in which case `build` has not touched the backend yet.
        drop(pool.get()?);

        Ok(Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            settings,
            inner: Mutex::new(Some(pool)),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// Connections currently open, idle or checked out. Zero once closed.
    pub fn open_connections(&self) -> u32 {
        self.inner
            .lock()
            .as_ref()
            .map_or(0, |pool| pool.state().connections)
    }

    pub fn idle_connections(&self) -> u32 {
        self.inner
            .lock()
            .as_ref()
            .map_or(0, |pool| pool.state().idle_connections)
    }

    /// Checks out a connection, waiting for one to be returned when all are in use.
    ///
    /// # Errors
    /// - [`DbError::PoolClosed`] once the pool has been closed.
    /// - [`DbError::Pool`] when no connection frees up within `connection_timeout_ms`.
    pub fn acquire(&self) -> DbResult<PooledConnection> {
        let pool = self
            .inner
            .lock()
            .clone()
            .ok_or_else(|| DbError::PoolClosed {
                name: self.name.clone(),
            })?;
        let conn = pool.get()?;
        if self.settings.debug {
            debug!(
                "event=db_acquire module=db status=ok name={} pool_id={}",
                self.name, self.id
            );
        }
        Ok(conn)
    }
}

impl Closeable for SqlitePool {
    type Error = DbError;

    /// Refuses further checkouts and drops the pool.
    ///
    /// Idle connections close with the pool; checked-out ones close when their
    /// guards are released.
    fn close(&self) -> DbResult<()> {
        let pool = self.inner.lock().take();
        match pool {
            Some(pool) => {
                drop(pool);
                Ok(())
            }
            None => Err(DbError::PoolClosed {
                name: self.name.clone(),
            }),
        }
    }

    fn describe(&self) -> String {
        self.id.to_string()
    }
}
