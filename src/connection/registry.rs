//! Connection Registry
//!
//! Maps each live descriptor to its shared connection context. The map is
//! the only place a context can be found by descriptor: once an entry is
//! removed, late readiness events for that descriptor find nothing and are
//! dropped.
//!
//! ## Locking
//!
//! Every operation is a single map touch inside one short critical
//! section. The lock is never held across I/O, and callers must not try to
//! lock a context while holding it; the lock order is always
//! context → registry.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// A context shared between the registry and the thread handling its events.
pub type Shared<T> = Arc<Mutex<T>>;

/// Errors reported by the registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("descriptor {0} is already registered")]
    Duplicate(RawFd),
}

/// Thread-safe descriptor → context map.
///
/// Generic over the context so the map can be exercised without sockets;
/// the server stores [`Connection`](crate::connection::Connection)s.
#[derive(Debug)]
pub struct ConnectionRegistry<T> {
    entries: Mutex<HashMap<RawFd, Shared<T>>>,
}

impl<T> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> ConnectionRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<RawFd, Shared<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `context` under `fd` and returns the shared handle.
    ///
    /// A descriptor that is already present is left untouched and reported
    /// as [`RegistryError::Duplicate`].
    pub fn add(&self, fd: RawFd, context: T) -> Result<Shared<T>, RegistryError> {
        let mut entries = self.entries();
        if entries.contains_key(&fd) {
            return Err(RegistryError::Duplicate(fd));
        }

        let shared = Arc::new(Mutex::new(context));
        entries.insert(fd, Arc::clone(&shared));
        Ok(shared)
    }

    /// Removes the entry for `fd`, if any.
    pub fn remove(&self, fd: RawFd) -> Option<Shared<T>> {
        self.entries().remove(&fd)
    }

    /// Returns the context registered under `fd`.
    pub fn lookup(&self, fd: RawFd) -> Option<Shared<T>> {
        self.entries().get(&fd).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<(RawFd, Shared<T>)> {
        self.entries().drain().collect()
    }
}

/// Locks a shared context, recovering it if a previous holder panicked.
pub fn lock<T>(shared: &Shared<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
