//! Hot-swappable database connection registry.
//! Maps logical names to live pool handles and replaces them at runtime.

pub mod config;
pub mod db;
pub mod logging;
pub mod registry;

pub use config::{ConfigError, ConfigResult, ConnectionSettings, RegistryConfig};
pub use db::{DbError, DbResult, PooledConnection, SqliteOpener, SqlitePool, SqliteRegistry};
pub use logging::{default_log_level, init_logging, logging_status, LogDestination};
pub use registry::{
    Closeable, Opener, Registry, RegistryError, RegistryResult, RetryPolicy, DEFAULT_NAME,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
