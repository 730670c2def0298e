//! Replicated merge-tree table engine: coordination core.
//!
//! Data lives in immutable sorted parts; replicas agree through a shared
//! action log in an external coordination service. Every replica mirrors the
//! log into its own queue and executes entries (fetch, merge, mutate, drop),
//! the elected leader proposes merges, and supervisory tasks keep the table
//! healthy: cleanup, part checking, alter application, session restart.

pub mod action_lock;
pub mod alter;
pub mod block_number;
pub mod cleanup;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod leader;
pub mod log_entry;
pub mod merge_select;
pub mod mutation;
pub mod part;
pub mod part_check;
pub mod queue;
pub mod quorum;
pub mod restart;
pub mod settings;
pub mod storage;
pub mod table;
pub mod writer;

pub use error::{EngineError, Result};
pub use part::{ActivePartSet, PartChecksums, PartInfo};
pub use settings::TableSettings;
pub use table::{ReplicatedTable, TableStatus};

/// Milliseconds since the Unix epoch.
pub fn unix_time_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch.
pub fn unix_time_secs() -> u64 {
    unix_time_ms() / 1000
}
