//! Suppression of redelivered updates.
//!
//! The platform delivers webhooks at least once, so the same `update_id` can
//! arrive several times. A [`DedupStore`] admits each id once per retention
//! window; ids replayed after the window closes are admitted again.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

pub use memory::MemoryDedupStore;
pub use sqlite::SqliteDedupStore;

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically record `update_id`. Returns `true` only for the first
    /// sighting inside the retention window; concurrent callers racing on
    /// the same id never both see `true`.
    async fn admit(&self, update_id: i64) -> Result<bool>;

    /// Drop records that have left the retention window. Returns the number
    /// of records removed.
    async fn prune(&self) -> Result<usize>;
}
