//! Persistent pipeline state: the dedup store and the run lock.

mod dedup;
mod lock;

use thiserror::Error;

pub use dedup::{DedupRecord, DedupStore};
pub use lock::RunLock;

/// Errors raised while reading or writing the dedup store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store contents invalid: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store file too large ({0} bytes)")]
    TooLarge(u64),
}

/// Errors raised while taking the run lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another run holds the lock and it is not stale yet.
    #[error("Run lock held by pid {pid} for {age_secs}s")]
    Held { pid: u32, age_secs: i64 },

    #[error("Lock file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock file encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
