//! Per-table engine configuration.

use std::time::Duration;

/// Quorum-timeout handling for an INSERT that requested a quorum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumPolicy {
    /// Undo the local commit and fail the INSERT.
    Rollback,
    /// Keep the part; quorum may still complete later.
    LeavePending,
}

/// Settings for one replicated table.
#[derive(Clone, Debug)]
pub struct TableSettings {
    /// HTTP keep-alive for the part-exchange server.
    pub keep_alive_timeout: Duration,
    /// Concurrent inbound part downloads per table.
    pub max_parallel_fetches_per_table: usize,
    /// Concurrent outbound part sends per table; 503 above this.
    pub max_parallel_sends_per_table: usize,
    /// Leader stops proposing merges once this many MERGE/MUTATE entries are
    /// unfinished across the queue.
    pub max_replicated_merges_in_queue: usize,
    /// Dedup keys kept under `/blocks` (count bound).
    pub replicated_deduplication_window: usize,
    /// Dedup keys kept under `/blocks` (age bound).
    pub replicated_deduplication_window_seconds: u64,
    /// Period between cleanup sweeps.
    pub cleanup_delay_period: Duration,
    /// Log entries kept behind the slowest replica.
    pub replicated_logs_to_keep: usize,
    /// Coordinator session liveness probe period.
    pub zookeeper_session_timeout: Duration,
    /// Valid (user, password) pairs for part exchange.
    pub interserver_credentials: Vec<(String, String)>,
    /// Accept requests with no credentials at all.
    pub allow_empty_interserver_credentials: bool,
    /// Largest sum of source-part sizes one merge may take.
    pub max_merge_total_size: u64,
    /// Most source parts one merge may take.
    pub max_parts_per_merge: usize,
    /// How long to wait for an INSERT quorum.
    pub insert_quorum_timeout: Duration,
    /// What to do when the quorum wait times out.
    pub quorum_policy: QuorumPolicy,
    /// This replica may enter leader election.
    pub can_become_leader: bool,
    /// A GET entry older than this whose part no replica holds is declared
    /// lost and replaced with an empty placeholder.
    pub lost_part_grace_period: Duration,
    /// Backoff base for failed queue entries; doubled per attempt.
    pub queue_retry_backoff: Duration,
    pub queue_retry_backoff_max: Duration,
    /// Period between merge-selector passes on the leader.
    pub merge_selecting_sleep: Duration,
    /// Period between queue-updater forced pulls when no watch fires.
    pub queue_update_sleep: Duration,
    /// Suspect parts checked concurrently at most.
    pub max_parallel_part_checks: usize,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            keep_alive_timeout: Duration::from_secs(10),
            max_parallel_fetches_per_table: 4,
            max_parallel_sends_per_table: 8,
            max_replicated_merges_in_queue: 16,
            replicated_deduplication_window: 100,
            replicated_deduplication_window_seconds: 7 * 24 * 3600,
            cleanup_delay_period: Duration::from_secs(30),
            replicated_logs_to_keep: 100,
            zookeeper_session_timeout: Duration::from_secs(10),
            interserver_credentials: Vec::new(),
            allow_empty_interserver_credentials: true,
            max_merge_total_size: 150 * 1024 * 1024 * 1024,
            max_parts_per_merge: 100,
            insert_quorum_timeout: Duration::from_secs(60),
            quorum_policy: QuorumPolicy::Rollback,
            can_become_leader: true,
            lost_part_grace_period: Duration::from_secs(300),
            queue_retry_backoff: Duration::from_millis(100),
            queue_retry_backoff_max: Duration::from_secs(30),
            merge_selecting_sleep: Duration::from_millis(500),
            queue_update_sleep: Duration::from_secs(1),
            max_parallel_part_checks: 2,
        }
    }
}

impl TableSettings {
    /// Compact settings for tests: short timers, small windows.
    pub fn fast() -> Self {
        Self {
            cleanup_delay_period: Duration::from_millis(100),
            replicated_deduplication_window: 10,
            replicated_logs_to_keep: 10,
            insert_quorum_timeout: Duration::from_secs(5),
            lost_part_grace_period: Duration::from_millis(500),
            queue_retry_backoff: Duration::from_millis(10),
            queue_retry_backoff_max: Duration::from_millis(200),
            merge_selecting_sleep: Duration::from_millis(50),
            queue_update_sleep: Duration::from_millis(50),
            ..Self::default()
        }
    }
}
