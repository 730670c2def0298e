//! Per-partition block-number allocation and INSERT deduplication.
//!
//! A block number is claimed with an ephemeral sequential node under
//! `/block_numbers/<partition>/`; the gap it leaves is this INSERT's
//! exclusive slot. The dedup key, when given, is claimed first with an
//! ephemeral `/blocks/<block_id>`. Committing swaps both ephemerals to
//! persistent nodes inside the part-commit multi; aborting removes them.

use repltree_coord::{
    paths, CoordError, CoordSession, CreateMode, Op, TablePaths,
};

use crate::error::Result;

/// Outcome of an allocation attempt.
pub enum AllocatedBlock {
    /// The block_id is already registered; the INSERT is a duplicate.
    /// The part name is empty while the original INSERT is still in flight.
    Deduplicated { part_name: String },
    Lock(BlockNumberLock),
}

/// Holds one allocated block number until committed or aborted.
pub struct BlockNumberLock {
    pub partition_id: String,
    pub number: i64,
    block_number_path: String,
    block_id_path: Option<String>,
    armed: bool,
}

/// Claim the next block number in `partition_id`, deduplicating by
/// `block_id` when one is supplied.
pub async fn allocate_block_number(
    session: &dyn CoordSession,
    table: &TablePaths,
    partition_id: &str,
    block_id: Option<&str>,
) -> Result<AllocatedBlock> {
    let block_id_path = match block_id {
        Some(id) => {
            let path = table.block(id);
            match session
                .create(&path, Vec::new(), CreateMode::Ephemeral)
                .await
            {
                Ok(_) => Some(path),
                Err(CoordError::NodeExists(_)) => {
                    let part_name = match session.get(&path).await {
                        Ok((data, _)) => String::from_utf8_lossy(&data).into_owned(),
                        // The competing INSERT aborted between our create and
                        // get; the caller retries the whole INSERT.
                        Err(CoordError::NoNode(_)) => String::new(),
                        Err(err) => return Err(err.into()),
                    };
                    return Ok(AllocatedBlock::Deduplicated { part_name });
                }
                Err(err) => return Err(err.into()),
            }
        }
        None => None,
    };

    let partition_dir = table.partition_block_numbers(partition_id);
    match session
        .create(&partition_dir, Vec::new(), CreateMode::Persistent)
        .await
    {
        Ok(_) | Err(CoordError::NodeExists(_)) => {}
        Err(err) => {
            cleanup_block_id(session, block_id_path.as_deref()).await;
            return Err(err.into());
        }
    }

    let created = match session
        .create(
            &table.partition_block_prefix(partition_id),
            Vec::new(),
            CreateMode::EphemeralSequential,
        )
        .await
    {
        Ok(path) => path,
        Err(err) => {
            cleanup_block_id(session, block_id_path.as_deref()).await;
            return Err(err.into());
        }
    };
    let number = paths::sequential_index(&created).unwrap_or(0) as i64;

    Ok(AllocatedBlock::Lock(BlockNumberLock {
        partition_id: partition_id.to_string(),
        number,
        block_number_path: created,
        block_id_path,
        armed: true,
    }))
}

async fn cleanup_block_id(session: &dyn CoordSession, path: Option<&str>) {
    if let Some(path) = path {
        let _ = repltree_coord::delete_if_exists(session, path).await;
    }
}

impl BlockNumberLock {
    /// Ops for the part-commit multi: swap both ephemerals persistent. The
    /// block-number gap stays reserved forever; the dedup node records the
    /// committed part name.
    pub fn commit_ops(&self, part_name: &str) -> Vec<Op> {
        let mut ops = vec![
            Op::Delete {
                path: self.block_number_path.clone(),
                version: None,
            },
            Op::Create {
                path: self.block_number_path.clone(),
                data: part_name.as_bytes().to_vec(),
                mode: CreateMode::Persistent,
            },
        ];
        if let Some(block_id_path) = &self.block_id_path {
            ops.push(Op::Delete {
                path: block_id_path.clone(),
                version: None,
            });
            ops.push(Op::Create {
                path: block_id_path.clone(),
                data: part_name.as_bytes().to_vec(),
                mode: CreateMode::Persistent,
            });
        }
        ops
    }

    /// The commit multi applied; nothing left to clean up.
    pub fn committed(mut self) {
        self.armed = false;
    }

    /// Abandon the allocation, freeing the dedup key and the number node.
    pub async fn abort(mut self, session: &dyn CoordSession) {
        self.armed = false;
        let _ = repltree_coord::delete_if_exists(session, &self.block_number_path).await;
        cleanup_block_id(session, self.block_id_path.as_deref()).await;
    }
}

impl Drop for BlockNumberLock {
    fn drop(&mut self) {
        if self.armed {
            // No async cleanup from drop; the ephemerals die with the
            // session. Callers on the happy path commit or abort explicitly.
            tracing::debug!(
                partition = %self.partition_id,
                number = self.number,
                "block-number lock dropped without commit"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repltree_coord::{ensure_path, Coordinator, MemoryCoordinator};

    async fn setup() -> (MemoryCoordinator, std::sync::Arc<dyn CoordSession>, TablePaths) {
        let coord = MemoryCoordinator::new();
        let session = coord.connect().await.unwrap();
        let table = TablePaths::new("/tables/t");
        ensure_path(session.as_ref(), &table.blocks_dir()).await.unwrap();
        ensure_path(session.as_ref(), &table.block_numbers_dir())
            .await
            .unwrap();
        (coord, session, table)
    }

    #[tokio::test]
    async fn numbers_are_distinct_and_increasing_under_concurrency() {
        let (_coord, session, table) = setup().await;
        let mut numbers = Vec::new();
        for _ in 0..16 {
            match allocate_block_number(session.as_ref(), &table, "2024", None)
                .await
                .unwrap()
            {
                AllocatedBlock::Lock(lock) => numbers.push(lock.number),
                AllocatedBlock::Deduplicated { .. } => panic!("no dedup key given"),
            }
        }
        let mut sorted = numbers.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), numbers.len());
        assert_eq!(&sorted, &numbers, "allocation order is the number order");
    }

    #[tokio::test]
    async fn dedup_hits_after_commit_return_the_part_name() {
        let (_coord, session, table) = setup().await;
        let lock = match allocate_block_number(session.as_ref(), &table, "2024", Some("k1"))
            .await
            .unwrap()
        {
            AllocatedBlock::Lock(lock) => lock,
            AllocatedBlock::Deduplicated { .. } => panic!("first insert cannot dedup"),
        };
        session.multi(lock.commit_ops("2024_0_0_0")).await.unwrap();
        lock.committed();

        match allocate_block_number(session.as_ref(), &table, "2024", Some("k1"))
            .await
            .unwrap()
        {
            AllocatedBlock::Deduplicated { part_name } => assert_eq!(part_name, "2024_0_0_0"),
            AllocatedBlock::Lock(_) => panic!("expected dedup"),
        }
    }

    #[tokio::test]
    async fn abort_frees_the_dedup_key() {
        let (_coord, session, table) = setup().await;
        let lock = match allocate_block_number(session.as_ref(), &table, "2024", Some("k1"))
            .await
            .unwrap()
        {
            AllocatedBlock::Lock(lock) => lock,
            AllocatedBlock::Deduplicated { .. } => panic!("first insert cannot dedup"),
        };
        let first_number = lock.number;
        lock.abort(session.as_ref()).await;

        match allocate_block_number(session.as_ref(), &table, "2024", Some("k1"))
            .await
            .unwrap()
        {
            AllocatedBlock::Lock(lock) => {
                assert!(lock.number > first_number, "gap is never reused");
            }
            AllocatedBlock::Deduplicated { .. } => panic!("aborted key must be free"),
        }
    }

    #[tokio::test]
    async fn session_expiry_releases_in_flight_allocations() {
        let (coord, session, table) = setup().await;
        let lock = match allocate_block_number(session.as_ref(), &table, "2024", Some("k1"))
            .await
            .unwrap()
        {
            AllocatedBlock::Lock(lock) => lock,
            AllocatedBlock::Deduplicated { .. } => panic!("first insert cannot dedup"),
        };
        coord.expire_session(session.id());
        // The ephemerals are gone with the session.
        let fresh = coord.connect().await.unwrap();
        assert!(fresh.exists(&table.block("k1")).await.unwrap().is_none());
        drop(lock);
        let _ = fresh;
    }
}
