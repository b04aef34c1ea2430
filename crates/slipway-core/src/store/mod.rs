//! `SQLite`-backed repositories.
//!
//! The durable store is a single `SQLite` database behind a shared
//! [`Database`] handle. Each repository borrows the handle plus an injected
//! [`Clock`](crate::clock::Clock); every mutating operation runs as one
//! transaction on the shared connection, which makes repository methods safe
//! to call from any number of threads and gives the claim-for-check protocol
//! its mutual-exclusion guarantee.
//!
//! Cascading deletes (resource → events → last-check) are issued explicitly
//! by the repositories rather than by schema-level cascade.

mod artifact;
mod check;
mod delivery_config;
mod resource;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OpenFlags};

use crate::error::RepoResult;

pub use artifact::{EnvironmentArtifactVersions, PromotionBuckets, SqliteArtifactRepository};
pub use delivery_config::SqliteDeliveryConfigRepository;
pub use resource::SqliteResourceRepository;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Shared handle to the `SQLite` store.
///
/// Cloning is cheap; clones share the same underlying connection. WAL mode
/// is enabled for on-disk databases so readers proceed while a write is in
/// progress.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens or creates a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the database cannot be opened or the
    /// schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> RepoResult<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory store, for tests and ephemeral use.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the schema cannot be applied.
    pub fn in_memory() -> RepoResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn initialize(conn: &Connection) -> RepoResult<()> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Locks the shared connection. A poisoned lock is recovered rather than
    /// propagated; the connection itself stays usable.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
