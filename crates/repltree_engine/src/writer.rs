//! INSERT path: block allocation, part commit, log append, quorum wait.
//!
//! One INSERT becomes one part. The commit is a single multi: columns
//! version guard, part registration, ephemeral-to-persistent swap of the
//! block allocation, the GET log entry, and the quorum record when asked
//! for. Any failing element rolls the whole commit back and the allocation
//! is abandoned.

use std::sync::Arc;
use std::time::Duration;

use repltree_coord::{paths, CoordError, CoordSession, CreateMode, Op, OpResult, TablePaths};

use crate::alter::TableStructure;
use crate::block_number::{allocate_block_number, AllocatedBlock};
use crate::error::{EngineError, Result};
use crate::log_entry::LogEntry;
use crate::part::PartInfo;
use crate::quorum::{self, QuorumStatus};
use crate::settings::{QuorumPolicy, TableSettings};
use crate::storage::{LocalStore, Part};

/// How many times a commit is replayed over version conflicts and in-flight
/// quorum records before giving up.
const MAX_COMMIT_RETRIES: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertResult {
    Committed {
        part_name: String,
        /// Index of the GET entry in the shared log.
        log_index: u64,
        /// False when the quorum wait timed out under `LeavePending`.
        quorum_satisfied: bool,
    },
    /// The block_id was already registered. The part name is empty while the
    /// original INSERT is still in flight.
    Deduplicated { part_name: String },
}

pub struct Writer {
    paths: TablePaths,
    replica_name: String,
    settings: TableSettings,
    store: Arc<dyn LocalStore>,
    structure: Arc<tokio::sync::RwLock<TableStructure>>,
}

impl Writer {
    pub fn new(
        paths: TablePaths,
        replica_name: &str,
        settings: TableSettings,
        store: Arc<dyn LocalStore>,
        structure: Arc<tokio::sync::RwLock<TableStructure>>,
    ) -> Self {
        Self {
            paths,
            replica_name: replica_name.to_string(),
            settings,
            store,
            structure,
        }
    }

    /// Write one block of rows as a new part.
    pub async fn write(
        &self,
        session: &dyn CoordSession,
        partition_id: &str,
        rows: &[String],
        block_id: Option<&str>,
        quorum: usize,
    ) -> Result<InsertResult> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .try_write(session, partition_id, rows, block_id, quorum)
                .await
            {
                Ok(result) => return Ok(result),
                Err(RetryableCommit::Retry(reason)) if attempt < MAX_COMMIT_RETRIES => {
                    tracing::debug!(%reason, attempt, "insert commit retrying");
                    tokio::time::sleep(Duration::from_millis(20 * attempt as u64)).await;
                }
                Err(RetryableCommit::Retry(reason)) => {
                    return Err(EngineError::TooManyConcurrentOperations(reason));
                }
                Err(RetryableCommit::Fail(err)) => return Err(err),
            }
        }
    }

    async fn try_write(
        &self,
        session: &dyn CoordSession,
        partition_id: &str,
        rows: &[String],
        block_id: Option<&str>,
        quorum: usize,
    ) -> std::result::Result<InsertResult, RetryableCommit> {
        let lock = match allocate_block_number(session, &self.paths, partition_id, block_id)
            .await
            .map_err(RetryableCommit::Fail)?
        {
            AllocatedBlock::Deduplicated { part_name } => {
                tracing::debug!(
                    partition = partition_id,
                    ?block_id,
                    part = %part_name,
                    "insert deduplicated"
                );
                return Ok(InsertResult::Deduplicated { part_name });
            }
            AllocatedBlock::Lock(lock) => lock,
        };

        let info = PartInfo::new(partition_id, lock.number, lock.number, 0);
        let part_name = info.name();
        let columns = {
            let structure = self.structure.read().await;
            if structure.columns.is_empty() {
                self.store.table_columns()
            } else {
                structure.columns.clone()
            }
        };
        let part = Part::from_rows(info, columns, rows);

        let columns_stat = match session.exists(&self.paths.columns()).await {
            Ok(Some(stat)) => Some(stat),
            Ok(None) => None,
            Err(err) => {
                lock.abort(session).await;
                return Err(RetryableCommit::Fail(err.into()));
            }
        };

        let mut ops = Vec::new();
        if let Some(stat) = columns_stat {
            ops.push(Op::Check {
                path: self.paths.columns(),
                version: stat.version,
            });
        }
        ops.push(Op::Create {
            path: self.paths.part(&self.replica_name, &part_name),
            data: part.checksums.to_json(),
            mode: CreateMode::Persistent,
        });
        ops.extend(lock.commit_ops(&part_name));
        let log_entry = LogEntry::get(
            &self.replica_name,
            part_name.clone(),
            block_id.map(str::to_string),
            quorum,
        );
        ops.push(Op::Create {
            path: self.paths.log_entry_prefix(),
            data: log_entry.to_bytes(),
            mode: CreateMode::PersistentSequential,
        });
        if quorum > 1 {
            ops.push(quorum::create_status_op(
                &self.paths,
                &QuorumStatus::new(part_name.clone(), quorum, &self.replica_name),
            ));
        }

        let results = match session.multi(ops).await {
            Ok(results) => results,
            Err(err) => {
                lock.abort(session).await;
                return Err(classify_commit_failure(err, &self.paths, &part_name));
            }
        };
        lock.committed();

        let log_index = results
            .iter()
            .filter_map(|r| match r {
                OpResult::Created { path } if path.contains("/log/log-") => {
                    paths::sequential_index(path.rsplit('/').next().unwrap_or(path))
                }
                _ => None,
            })
            .next()
            .unwrap_or(0);

        self.store
            .commit_part(part)
            .map_err(RetryableCommit::Fail)?;
        tracing::info!(
            part = %part_name,
            log_index,
            quorum,
            "insert committed"
        );

        let quorum_satisfied = if quorum > 1 {
            self.wait_for_quorum(session, &part_name)
                .await
                .map_err(RetryableCommit::Fail)?
        } else {
            true
        };
        Ok(InsertResult::Committed {
            part_name,
            log_index,
            quorum_satisfied,
        })
    }

    /// Wait until the quorum record for `part_name` clears, honoring the
    /// configured timeout policy.
    async fn wait_for_quorum(
        &self,
        session: &dyn CoordSession,
        part_name: &str,
    ) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + self.settings.insert_quorum_timeout;
        loop {
            let status_path = self.paths.quorum_status();
            let watch = match session.get_watch(&status_path).await {
                Ok((data, _, watch)) => {
                    let status = QuorumStatus::from_json(&data)?;
                    if status.part_name != part_name {
                        // Superseded: our quorum completed earlier.
                        return Ok(true);
                    }
                    if status.is_satisfied() {
                        return Ok(true);
                    }
                    watch
                }
                Err(CoordError::NoNode(_)) => return Ok(true),
                Err(err) => return Err(err.into()),
            };

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return self.on_quorum_timeout(session, part_name).await;
            }
            tokio::select! {
                _ = watch.wait() => {}
                _ = tokio::time::sleep(remaining) => {
                    return self.on_quorum_timeout(session, part_name).await;
                }
            }
        }
    }

    async fn on_quorum_timeout(
        &self,
        session: &dyn CoordSession,
        part_name: &str,
    ) -> Result<bool> {
        match self.settings.quorum_policy {
            QuorumPolicy::LeavePending => {
                tracing::warn!(part = %part_name, "quorum timeout; leaving part pending");
                Ok(false)
            }
            QuorumPolicy::Rollback => {
                tracing::warn!(part = %part_name, "quorum timeout; rolling back insert");
                // Remove the quorum record, the part registration and the
                // local part. The log GET stays and will eventually be
                // declared lost; readers never counted the part.
                if let Some((status, version)) =
                    quorum::read_status(session, &self.paths).await?
                {
                    if status.part_name == part_name {
                        match session.delete(&self.paths.quorum_status(), Some(version)).await {
                            Ok(())
                            | Err(CoordError::NoNode(_))
                            | Err(CoordError::BadVersion { .. }) => {}
                            Err(err) => return Err(err.into()),
                        }
                    }
                }
                repltree_coord::delete_if_exists(
                    session,
                    &self.paths.part(&self.replica_name, part_name),
                )
                .await?;
                match self.store.remove_part(part_name) {
                    Ok(()) | Err(EngineError::PartNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
                Err(EngineError::QuorumTimeout(part_name.to_string()))
            }
        }
    }
}

enum RetryableCommit {
    Retry(String),
    Fail(EngineError),
}

/// Sort a failed commit multi into retry-in-place vs. hard failure.
fn classify_commit_failure(
    err: CoordError,
    table: &TablePaths,
    part_name: &str,
) -> RetryableCommit {
    let (index, op_err) = match &err {
        CoordError::MultiFailed { index, source } => (*index, source.as_ref()),
        other => (usize::MAX, other),
    };
    match op_err {
        // Concurrent ALTER bumped /columns: refresh and retry.
        CoordError::BadVersion { path, .. } if path == &table.columns() => {
            RetryableCommit::Retry("columns changed during commit".into())
        }
        // Another quorum INSERT is still in flight.
        CoordError::NodeExists(path) if path == &table.quorum_status() => {
            RetryableCommit::Retry("another quorum insert is in flight".into())
        }
        CoordError::NodeExists(path) if path.ends_with(part_name) => {
            RetryableCommit::Fail(EngineError::PartAlreadyExists(part_name.to_string()))
        }
        CoordError::ConnectionLoss => {
            RetryableCommit::Retry("coordinator unavailable".into())
        }
        CoordError::SessionExpired => {
            RetryableCommit::Fail(EngineError::CoordinatorSessionExpired)
        }
        _ => {
            tracing::warn!(op_index = index, error = %err, "insert commit failed");
            RetryableCommit::Fail(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use repltree_coord::{ensure_path, Coordinator, MemoryCoordinator};

    const ROOT: &str = "/tables/t";

    struct Fixture {
        _coord: MemoryCoordinator,
        session: Arc<dyn CoordSession>,
        store: Arc<MemoryStore>,
        writer: Writer,
    }

    async fn fixture(settings: TableSettings) -> Fixture {
        let coord = MemoryCoordinator::new();
        let session = coord.connect().await.unwrap();
        let paths = TablePaths::new(ROOT);
        for dir in [
            paths.log_dir(),
            paths.blocks_dir(),
            paths.block_numbers_dir(),
            paths.quorum_last_part_dir(),
            paths.parts_dir("r1"),
        ] {
            ensure_path(session.as_ref(), &dir).await.unwrap();
        }
        let store = Arc::new(MemoryStore::new());
        store.apply_columns(&["v".into()]).unwrap();
        let structure = Arc::new(tokio::sync::RwLock::new(TableStructure::default()));
        let writer = Writer::new(paths, "r1", settings, store.clone(), structure);
        Fixture {
            _coord: coord,
            session,
            store,
            writer,
        }
    }

    #[tokio::test]
    async fn insert_commits_part_log_entry_and_dedup_key() {
        let fx = fixture(TableSettings::fast()).await;
        let result = fx
            .writer
            .write(
                fx.session.as_ref(),
                "2024",
                &["row1".into(), "row2".into()],
                Some("blk-1"),
                0,
            )
            .await
            .unwrap();
        let InsertResult::Committed {
            part_name,
            log_index,
            quorum_satisfied,
        } = result
        else {
            panic!("first insert cannot dedup");
        };
        assert_eq!(part_name, "2024_0_0_0");
        assert_eq!(log_index, 0);
        assert!(quorum_satisfied);

        let paths = TablePaths::new(ROOT);
        assert!(fx
            .session
            .exists(&paths.part("r1", &part_name))
            .await
            .unwrap()
            .is_some());
        let (block_data, stat) = fx.session.get(&paths.block("blk-1")).await.unwrap();
        assert_eq!(block_data, part_name.as_bytes());
        assert_eq!(stat.ephemeral_owner, 0, "dedup key is persistent after commit");
        assert_eq!(fx.session.children(&paths.log_dir()).await.unwrap().len(), 1);
        assert_eq!(fx.store.total_rows(), 2);
    }

    #[tokio::test]
    async fn duplicate_block_id_is_deduplicated() {
        let fx = fixture(TableSettings::fast()).await;
        fx.writer
            .write(fx.session.as_ref(), "2024", &["a".into()], Some("k"), 0)
            .await
            .unwrap();
        let second = fx
            .writer
            .write(
                fx.session.as_ref(),
                "2024",
                &["different".into()],
                Some("k"),
                0,
            )
            .await
            .unwrap();
        assert_eq!(
            second,
            InsertResult::Deduplicated {
                part_name: "2024_0_0_0".into()
            }
        );
        // Only one part and one log entry came out of two inserts.
        let paths = TablePaths::new(ROOT);
        assert_eq!(fx.session.children(&paths.log_dir()).await.unwrap().len(), 1);
        assert_eq!(fx.store.enumerate_active_parts().len(), 1);
    }

    #[tokio::test]
    async fn quorum_write_completes_when_peer_acks() {
        let fx = fixture(TableSettings::fast()).await;
        let session = fx.session.clone();
        let paths = TablePaths::new(ROOT);

        let acker = tokio::spawn({
            let session = session.clone();
            let paths = paths.clone();
            async move {
                // Peer replica acks once it "fetched" the part.
                for _ in 0..100 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    if quorum::read_status(session.as_ref(), &paths)
                        .await
                        .unwrap()
                        .is_some()
                    {
                        quorum::update_quorum(session.as_ref(), &paths, "r2", "2024_0_0_0")
                            .await
                            .unwrap();
                        return;
                    }
                }
            }
        });

        let result = fx
            .writer
            .write(fx.session.as_ref(), "2024", &["a".into()], None, 2)
            .await
            .unwrap();
        acker.await.unwrap();
        assert!(matches!(
            result,
            InsertResult::Committed {
                quorum_satisfied: true,
                ..
            }
        ));
        let (data, _) = fx
            .session
            .get(&paths.quorum_last_part("2024"))
            .await
            .unwrap();
        assert_eq!(data, b"2024_0_0_0");
    }

    #[tokio::test]
    async fn quorum_timeout_rolls_back_when_configured() {
        let settings = TableSettings {
            insert_quorum_timeout: Duration::from_millis(50),
            quorum_policy: QuorumPolicy::Rollback,
            ..TableSettings::fast()
        };
        let fx = fixture(settings).await;
        let err = fx
            .writer
            .write(fx.session.as_ref(), "2024", &["a".into()], None, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::QuorumTimeout(_)));

        let paths = TablePaths::new(ROOT);
        assert!(fx.store.enumerate_active_parts().is_empty());
        assert!(fx
            .session
            .exists(&paths.part("r1", "2024_0_0_0"))
            .await
            .unwrap()
            .is_none());
        assert!(quorum::read_status(fx.session.as_ref(), &paths)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn quorum_timeout_leaves_part_when_configured() {
        let settings = TableSettings {
            insert_quorum_timeout: Duration::from_millis(50),
            quorum_policy: QuorumPolicy::LeavePending,
            ..TableSettings::fast()
        };
        let fx = fixture(settings).await;
        let result = fx
            .writer
            .write(fx.session.as_ref(), "2024", &["a".into()], None, 2)
            .await
            .unwrap();
        assert!(matches!(
            result,
            InsertResult::Committed {
                quorum_satisfied: false,
                ..
            }
        ));
        assert_eq!(fx.store.enumerate_active_parts().len(), 1);
    }
}
