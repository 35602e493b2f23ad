//! Keyed, hot-swappable connection registry.
//!
//! # Responsibility
//! - Map logical database names to live pool handles.
//! - Replace a handle at runtime without breaking readers or leaking the old one.
//! - Drain and close every handle at shutdown.
//!
//! # Invariants
//! - At most one handle per name is reachable through [`Registry::get`].
//! - A replacement becomes visible in a single map insert; readers see the old
//!   or the new handle, never an absent entry mid-swap.
//! - A displaced handle is closed exactly once, after its replacement is visible,
//!   and never while a map lock is held.
//! - A failed update with an existing handle leaves that handle untouched.

pub mod retry;

use dashmap::DashMap;
use log::{error, info, warn};
use parking_lot::RwLock;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub use retry::{retry, RetryExhausted, RetryPolicy};

/// Name used by [`Registry::get_default`] until [`Registry::set_default_name`] runs.
pub const DEFAULT_NAME: &str = "default";

/// Capability every stored handle must provide.
pub trait Closeable: Send + Sync {
    type Error: Display;

    /// Releases the underlying resources.
    ///
    /// The registry calls this at most once per handle. Later calls from other
    /// owners may fail but must not panic.
    fn close(&self) -> Result<(), Self::Error>;

    /// Short identity used in log lines.
    fn describe(&self) -> String {
        String::new()
    }
}

/// Produces a freshly opened handle for one logical name.
///
/// Called repeatedly under the retry policy; must not keep ownership of what it returns.
pub trait Opener: Send + Sync {
    type Handle: Closeable;
    type Error: Error + Send + Sync + 'static;

    fn open(&self, name: &str) -> Result<Self::Handle, Self::Error>;
}

impl<F, H, E> Opener for F
where
    F: Fn(&str) -> Result<H, E> + Send + Sync,
    H: Closeable,
    E: Error + Send + Sync + 'static,
{
    type Handle = H;
    type Error = E;

    fn open(&self, name: &str) -> Result<H, E> {
        self(name)
    }
}

/// Bring-up and hot-swap failures.
#[derive(Debug)]
pub enum RegistryError<E> {
    /// Retries exhausted and no handle exists for the name. Callers cannot proceed.
    Unavailable {
        name: String,
        attempts: u32,
        source: E,
    },
    /// Retries exhausted while an older handle is still active and still served.
    UpdateRejected {
        name: String,
        attempts: u32,
        source: E,
    },
}

impl<E> RegistryError<E> {
    /// `true` when the name is left without any usable handle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Unavailable { name, .. } | Self::UpdateRejected { name, .. } => name,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Unavailable { attempts, .. } | Self::UpdateRejected { attempts, .. } => {
                *attempts
            }
        }
    }

    /// Last opener error observed before giving up.
    pub fn opener_error(&self) -> &E {
        match self {
            Self::Unavailable { source, .. } | Self::UpdateRejected { source, .. } => source,
        }
    }
}

impl<E: Display> Display for RegistryError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable {
                name,
                attempts,
                source,
            } => write!(
                f,
                "database `{name}` unavailable after {attempts} attempt(s): {source}"
            ),
            Self::UpdateRejected {
                name,
                attempts,
                source,
            } => write!(
                f,
                "update of database `{name}` rejected after {attempts} attempt(s), keeping current handle: {source}"
            ),
        }
    }
}

impl<E: Error + 'static> Error for RegistryError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.opener_error())
    }
}

pub type RegistryResult<T, O> = Result<T, RegistryError<<O as Opener>::Error>>;

/// Concurrent name → handle table with retrying bring-up and hot-swap.
///
/// Construct one per process (or per test) and pass it to consumers explicitly.
pub struct Registry<O: Opener> {
    opener: O,
    retry: RetryPolicy,
    entries: DashMap<String, Arc<O::Handle>>,
    default_name: RwLock<String>,
}

impl<O: Opener> Registry<O> {
    pub fn new(opener: O) -> Self {
        Self::with_retry_policy(opener, RetryPolicy::default())
    }

    pub fn with_retry_policy(opener: O, retry: RetryPolicy) -> Self {
        Self {
            opener,
            retry,
            entries: DashMap::new(),
            default_name: RwLock::new(DEFAULT_NAME.to_string()),
        }
    }

    pub fn with_default_name(self, name: impl Into<String>) -> Self {
        self.set_default_name(name);
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn set_default_name(&self, name: impl Into<String>) {
        *self.default_name.write() = name.into();
    }

    pub fn default_name(&self) -> String {
        self.default_name.read().clone()
    }

    /// First-time bring-up of `name`; behaves like [`Registry::update`] when the name exists.
    ///
    /// Blocks for at most `attempts × delay` while retrying.
    ///
    /// # Errors
    /// - [`RegistryError::Unavailable`] when every attempt failed and there is
    ///   nothing to fall back to. Treat it as unrecoverable.
    /// - [`RegistryError::UpdateRejected`] when the name was already active.
    pub fn open(&self, name: &str) -> RegistryResult<Arc<O::Handle>, O> {
        self.open_and_swap(name)
    }

    /// Replaces the handle for `name` with a freshly opened one.
    ///
    /// On success the old handle, if any, is closed after the new one is visible.
    /// On failure the old handle stays active and the error is returned.
    pub fn update(&self, name: &str) -> RegistryResult<(), O> {
        self.open_and_swap(name).map(|_| ())
    }

    /// Returns the active handle for `name`, or `None` when the name is unknown.
    pub fn get(&self, name: &str) -> Option<Arc<O::Handle>> {
        self.entries.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the active handle for the default name.
    pub fn get_default(&self) -> Option<Arc<O::Handle>> {
        let name = self.default_name();
        self.get(&name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Returns sorted names of active entries.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes `name` and closes its handle. Returns `false` when nothing was removed.
    pub fn remove(&self, name: &str) -> bool {
        match self.entries.remove(name) {
            Some((name, handle)) => {
                self.close_handle(&name, &handle, "remove");
                true
            }
            None => false,
        }
    }

    /// Removes and closes every entry. Returns how many handles this call closed.
    ///
    /// Safe to run concurrently: each entry is closed by whichever caller removed it.
    pub fn close_all(&self) -> usize {
        let names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for name in names {
            let Some((name, handle)) = self.entries.remove(&name) else {
                continue;
            };
            warn!("event=db_close module=registry status=start name={}", name);
            self.close_handle(&name, &handle, "close_all");
            closed += 1;
        }
        closed
    }

    fn open_and_swap(&self, name: &str) -> RegistryResult<Arc<O::Handle>, O> {
        let opened = retry(&self.retry, name, |_| self.opener.open(name));

        let handle = match opened {
            Ok(handle) => Arc::new(handle),
            Err(exhausted) => return Err(self.reject(name, exhausted)),
        };

        // Single insert: readers flip from old to new with no absent window.
        let displaced = self.entries.insert(name.to_string(), Arc::clone(&handle));
        info!(
            "event=db_swap module=registry status=ok name={} handle={} replaced={}",
            name,
            handle.describe(),
            displaced.is_some()
        );

        if let Some(old) = displaced {
            self.close_handle(name, &old, "swap");
        }
        Ok(handle)
    }

    fn reject(&self, name: &str, exhausted: RetryExhausted<O::Error>) -> RegistryError<O::Error> {
        let RetryExhausted {
            attempts,
            last_error,
        } = exhausted;
        if self.entries.contains_key(name) {
            warn!(
                "event=db_swap module=registry status=rejected name={} attempts={} error={}",
                name, attempts, last_error
            );
            RegistryError::UpdateRejected {
                name: name.to_string(),
                attempts,
                source: last_error,
            }
        } else {
            error!(
                "event=db_swap module=registry status=fatal name={} attempts={} error={}",
                name,
                attempts,
                last_error
            );
            RegistryError::Unavailable {
                name: name.to_string(),
                attempts,
                source: last_error,
            }
        }
    }

    fn close_handle(&self, name: &str, handle: &O::Handle, reason: &str) {
        match handle.close() {
            Ok(()) => info!(
                "event=db_close module=registry status=ok name={} handle={} reason={}",
                name,
                handle.describe(),
                reason
            ),
            Err(err) => warn!(
                "event=db_close module=registry status=error name={} handle={} reason={} error={}",
                name,
                handle.describe(),
                reason,
                err
            ),
        }
    }
}
