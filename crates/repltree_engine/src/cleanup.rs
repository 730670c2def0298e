//! Garbage collection of old log entries and dedup blocks.
//!
//! Log entries already copied by every live replica are removed, keeping a
//! configured tail. Dedup blocks are trimmed by count and by age, whichever
//! trims more. Lost replicas (`is_lost`) do not hold the log back; they
//! recover by cloning.

use repltree_coord::{paths, CoordError, CoordSession, TablePaths};

use crate::error::Result;
use crate::settings::TableSettings;
use crate::unix_time_ms;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub log_entries_removed: usize,
    pub blocks_removed: usize,
}

pub struct CleanupTask {
    paths: TablePaths,
    settings: TableSettings,
}

impl CleanupTask {
    pub fn new(paths: TablePaths, settings: TableSettings) -> Self {
        Self { paths, settings }
    }

    pub async fn run_once(&self, session: &dyn CoordSession) -> Result<CleanupStats> {
        let mut stats = CleanupStats::default();
        stats.log_entries_removed = self.clear_old_log_entries(session).await?;
        stats.blocks_removed = self.clear_old_blocks(session).await?;
        if stats != CleanupStats::default() {
            tracing::debug!(
                log_entries = stats.log_entries_removed,
                blocks = stats.blocks_removed,
                "cleanup pass finished"
            );
        }
        Ok(stats)
    }

    /// Remove log entries every live replica has already mirrored, keeping
    /// the configured tail for late joiners. An inactive replica that lags
    /// too far is marked lost instead of holding the log back forever; it
    /// recovers by cloning an active replica.
    async fn clear_old_log_entries(&self, session: &dyn CoordSession) -> Result<usize> {
        let log_dir = self.paths.log_dir();
        let mut names = session.children(&log_dir).await?;
        names.sort();
        if names.is_empty() {
            return Ok(0);
        }
        let max_index = names
            .iter()
            .filter_map(|n| paths::sequential_index(n))
            .max()
            .unwrap_or(0);
        let lost_lag = (self.settings.replicated_logs_to_keep as u64).saturating_mul(2);

        let mut min_pointer = u64::MAX;
        for replica in session.children(&self.paths.replicas_dir()).await? {
            if self.replica_is_lost(session, &replica).await? {
                continue;
            }
            let pointer = match session.get(&self.paths.log_pointer(&replica)).await {
                Ok((data, _)) => String::from_utf8_lossy(&data).trim().parse().unwrap_or(0),
                Err(CoordError::NoNode(_)) => 0,
                Err(err) => return Err(err.into()),
            };
            let active = session
                .exists(&self.paths.is_active(&replica))
                .await?
                .is_some();
            if !active && max_index.saturating_sub(pointer) > lost_lag {
                tracing::warn!(
                    replica = %replica,
                    pointer,
                    max_index,
                    "inactive replica lags too far, marking lost"
                );
                let flag = self.paths.is_lost(&replica);
                match session.set(&flag, b"1".to_vec(), None).await {
                    Ok(_) => continue,
                    Err(CoordError::NoNode(_)) => {
                        match session
                            .create(&flag, b"1".to_vec(), repltree_coord::CreateMode::Persistent)
                            .await
                        {
                            Ok(_) | Err(CoordError::NodeExists(_)) => continue,
                            Err(err) => return Err(err.into()),
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            min_pointer = min_pointer.min(pointer);
        }
        if min_pointer == u64::MAX {
            return Ok(0);
        }

        let keep_from = (max_index + 1).saturating_sub(self.settings.replicated_logs_to_keep as u64);
        let bound = min_pointer.min(keep_from);

        let mut removed = 0;
        for name in &names {
            let Some(index) = paths::sequential_index(name) else {
                continue;
            };
            if index >= bound {
                break;
            }
            match session.delete(&format!("{log_dir}/{name}"), None).await {
                Ok(()) | Err(CoordError::NoNode(_)) => removed += 1,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(removed)
    }

    /// Trim `/blocks` to the dedup window: newest N by creation time, none
    /// older than the age bound.
    async fn clear_old_blocks(&self, session: &dyn CoordSession) -> Result<usize> {
        let blocks_dir = self.paths.blocks_dir();
        let names = match session.children(&blocks_dir).await {
            Ok(names) => names,
            Err(CoordError::NoNode(_)) => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut timed: Vec<(u64, String)> = Vec::with_capacity(names.len());
        for name in names {
            let path = format!("{blocks_dir}/{name}");
            match session.exists(&path).await? {
                // In-flight ephemerals belong to running INSERTs.
                Some(stat) if stat.ephemeral_owner == 0 => timed.push((stat.ctime_ms, name)),
                _ => continue,
            }
        }
        timed.sort();

        let age_bound_ms = self
            .settings
            .replicated_deduplication_window_seconds
            .saturating_mul(1000);
        let now = unix_time_ms();
        let over_count = timed
            .len()
            .saturating_sub(self.settings.replicated_deduplication_window);

        let mut removed = 0;
        for (idx, (ctime_ms, name)) in timed.iter().enumerate() {
            let too_many = idx < over_count;
            let too_old = now.saturating_sub(*ctime_ms) > age_bound_ms;
            if !too_many && !too_old {
                break;
            }
            match session.delete(&format!("{blocks_dir}/{name}"), None).await {
                Ok(()) | Err(CoordError::NoNode(_)) => removed += 1,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(removed)
    }

    /// Drop the dedup keys of one partition (used by DROP PARTITION).
    pub async fn clear_blocks_in_partition(
        &self,
        session: &dyn CoordSession,
        partition_id: &str,
        block_ids: &[String],
    ) -> Result<usize> {
        let mut removed = 0;
        for block_id in block_ids {
            let path = self.paths.block(block_id);
            match session.delete(&path, None).await {
                Ok(()) => removed += 1,
                Err(CoordError::NoNode(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        if removed > 0 {
            tracing::debug!(partition = partition_id, removed, "cleared partition dedup keys");
        }
        Ok(removed)
    }

    async fn replica_is_lost(&self, session: &dyn CoordSession, replica: &str) -> Result<bool> {
        match session.get(&self.paths.is_lost(replica)).await {
            Ok((data, _)) => Ok(data == b"1"),
            Err(CoordError::NoNode(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repltree_coord::{ensure_path, Coordinator, CreateMode, MemoryCoordinator};
    use std::sync::Arc;

    const ROOT: &str = "/tables/t";

    async fn setup(
        settings: TableSettings,
    ) -> (MemoryCoordinator, Arc<dyn CoordSession>, CleanupTask) {
        let coord = MemoryCoordinator::new();
        let session = coord.connect().await.unwrap();
        let paths = TablePaths::new(ROOT);
        for dir in [
            paths.log_dir(),
            paths.blocks_dir(),
            paths.replica("r1"),
            paths.replica("r2"),
        ] {
            ensure_path(session.as_ref(), &dir).await.unwrap();
        }
        let task = CleanupTask::new(paths, settings);
        (coord, session, task)
    }

    async fn set_pointer(session: &dyn CoordSession, replica: &str, value: u64) {
        let paths = TablePaths::new(ROOT);
        session
            .create(
                &paths.log_pointer(replica),
                value.to_string().into_bytes(),
                CreateMode::Persistent,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn log_trim_respects_slowest_replica_and_keep_tail() {
        let settings = TableSettings {
            replicated_logs_to_keep: 2,
            ..TableSettings::default()
        };
        let (_coord, session, task) = setup(settings).await;
        let paths = TablePaths::new(ROOT);
        for _ in 0..6 {
            session
                .create(
                    &paths.log_entry_prefix(),
                    b"x".to_vec(),
                    CreateMode::PersistentSequential,
                )
                .await
                .unwrap();
        }
        set_pointer(session.as_ref(), "r1", 6).await;
        set_pointer(session.as_ref(), "r2", 3).await;

        let stats = task.run_once(session.as_ref()).await.unwrap();
        // min pointer 3 < keep bound 4: entries 0..3 go.
        assert_eq!(stats.log_entries_removed, 3);
        let remaining = session.children(&paths.log_dir()).await.unwrap();
        assert_eq!(remaining.len(), 3);
    }

    #[tokio::test]
    async fn lost_replicas_do_not_hold_the_log() {
        let settings = TableSettings {
            replicated_logs_to_keep: 1,
            ..TableSettings::default()
        };
        let (_coord, session, task) = setup(settings).await;
        let paths = TablePaths::new(ROOT);
        for _ in 0..4 {
            session
                .create(
                    &paths.log_entry_prefix(),
                    b"x".to_vec(),
                    CreateMode::PersistentSequential,
                )
                .await
                .unwrap();
        }
        set_pointer(session.as_ref(), "r1", 4).await;
        set_pointer(session.as_ref(), "r2", 0).await;
        session
            .create(&paths.is_lost("r2"), b"1".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        let stats = task.run_once(session.as_ref()).await.unwrap();
        assert_eq!(stats.log_entries_removed, 3);
    }

    #[tokio::test]
    async fn lagging_inactive_replica_is_marked_lost() {
        let settings = TableSettings {
            replicated_logs_to_keep: 1,
            ..TableSettings::default()
        };
        let (_coord, session, task) = setup(settings).await;
        let paths = TablePaths::new(ROOT);
        for _ in 0..4 {
            session
                .create(
                    &paths.log_entry_prefix(),
                    b"x".to_vec(),
                    CreateMode::PersistentSequential,
                )
                .await
                .unwrap();
        }
        set_pointer(session.as_ref(), "r1", 4).await;
        set_pointer(session.as_ref(), "r2", 0).await;
        session
            .create(&paths.is_lost("r2"), b"0".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        let stats = task.run_once(session.as_ref()).await.unwrap();
        // r2 lags by 3 > 2x keep: marked lost, log trimmed past it.
        assert_eq!(stats.log_entries_removed, 3);
        let (flag, _) = session.get(&paths.is_lost("r2")).await.unwrap();
        assert_eq!(flag, b"1");
    }

    #[tokio::test]
    async fn block_window_is_count_bounded() {
        let settings = TableSettings {
            replicated_deduplication_window: 2,
            ..TableSettings::default()
        };
        let (_coord, session, task) = setup(settings).await;
        let paths = TablePaths::new(ROOT);
        for id in ["b1", "b2", "b3", "b4"] {
            session
                .create(&paths.block(id), b"p".to_vec(), CreateMode::Persistent)
                .await
                .unwrap();
        }
        set_pointer(session.as_ref(), "r1", 0).await;
        set_pointer(session.as_ref(), "r2", 0).await;

        let stats = task.run_once(session.as_ref()).await.unwrap();
        assert_eq!(stats.blocks_removed, 2);
        assert_eq!(
            session.children(&paths.blocks_dir()).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn in_flight_ephemeral_blocks_are_never_trimmed() {
        let settings = TableSettings {
            replicated_deduplication_window: 0,
            ..TableSettings::default()
        };
        let (_coord, session, task) = setup(settings).await;
        let paths = TablePaths::new(ROOT);
        session
            .create(&paths.block("live"), Vec::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        set_pointer(session.as_ref(), "r1", 0).await;
        set_pointer(session.as_ref(), "r2", 0).await;

        let stats = task.run_once(session.as_ref()).await.unwrap();
        assert_eq!(stats.blocks_removed, 0);
        assert!(session.exists(&paths.block("live")).await.unwrap().is_some());
    }
}
