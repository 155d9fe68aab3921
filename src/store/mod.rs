//! # Hit Store
//!
//! Pending-hit queues the dispatcher drains. Implementations synchronize
//! internally; a removing fetch never hands the same hit to two callers.
//!
//! - **Version**: 1.1.0
//! - **Since**: 0.1.0
//!
//! ## Changelog
//! - 1.1.0: Added SQLite-backed store for hits that survive restarts
//! - 1.0.0: Initial release with in-memory store

pub mod memory;
pub mod sqlite;

use crate::hit::Hit;
use anyhow::Result;

pub use memory::MemoryHitStore;
pub use sqlite::SqliteHitStore;

/// Storage for hits waiting to be sent
pub trait HitStore: Send + Sync {
    /// Open the underlying storage. Opening an open store is a no-op.
    fn open(&self) -> Result<()>;

    /// Release the underlying storage. Pending hits stay persisted where the
    /// backend supports it.
    fn close(&self);

    fn is_open(&self) -> bool;

    /// Append one hit. Fails when the store is closed.
    fn add_hit(&self, hit: &Hit) -> Result<()>;

    /// Append many hits in one operation
    fn add_hits(&self, hits: Vec<Hit>) -> Result<()>;

    /// Return up to `max_count` hits in stable order, removing them from the
    /// store when `remove` is set.
    fn fetch_hits(&self, max_count: usize, remove: bool) -> Result<Vec<Hit>>;

    /// Number of pending hits
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
