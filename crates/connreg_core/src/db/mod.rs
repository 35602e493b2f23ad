//! SQLite-backed pool handles for the connection registry.
//!
//! # Responsibility
//! - Configure SQLite connections for one logical database.
//! - Pool those connections behind a closable handle the registry can swap.
//!
//! # Invariants
//! - Every pooled connection has `foreign_keys=ON` and the configured busy timeout.
//! - A closed pool never hands out connections again.

use std::error::Error;
use std::fmt::{Display, Formatter};

mod open;
mod pool;

pub use open::{ConnectionPragmas, ConnectionTarget, SqliteOpener, SqliteRegistry};
pub use pool::{PooledConnection, SqlitePool};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    /// Building the pool or checking out a connection failed, including checkout timeouts.
    Pool(r2d2::Error),
    PoolClosed { name: String },
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pool(err) => write!(f, "{err}"),
            Self::PoolClosed { name } => write!(f, "pool for database `{name}` is closed"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Pool(err) => Some(err),
            Self::PoolClosed { .. } => None,
        }
    }
}

impl From<r2d2::Error> for DbError {
    fn from(value: r2d2::Error) -> Self {
        Self::Pool(value)
    }
}
