//! Quorum-write tracking.
//!
//! `/quorum/status` holds the single in-flight quorum part with its required
//! and acknowledged replica sets; `/quorum/last_part/<partition>` holds the
//! newest quorum-committed part per partition and never regresses. Readers
//! under sequential consistency exclude blocks beyond `last_part`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use repltree_coord::{CoordError, CoordSession, CreateMode, Op, TablePaths};

use crate::error::{EngineError, Result};
use crate::part::PartInfo;

/// The record stored at `/quorum/status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumStatus {
    pub part_name: String,
    pub required: usize,
    pub replicas: BTreeSet<String>,
}

impl QuorumStatus {
    pub fn new(part_name: String, required: usize, first_replica: &str) -> Self {
        let mut replicas = BTreeSet::new();
        replicas.insert(first_replica.to_string());
        Self {
            part_name,
            required,
            replicas,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.replicas.len() >= self.required
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("quorum status serialize")
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|err| {
            EngineError::LogicalInvariantViolated(format!("bad quorum status: {err}"))
        })
    }
}

/// Op creating `/quorum/status` inside the INSERT commit multi. Fails the
/// whole commit with `NodeExists` while another quorum write is in flight.
pub fn create_status_op(table: &TablePaths, status: &QuorumStatus) -> Op {
    Op::Create {
        path: table.quorum_status(),
        data: status.to_json(),
        mode: CreateMode::Persistent,
    }
}

/// Read the in-flight quorum record, if any.
pub async fn read_status(
    session: &dyn CoordSession,
    table: &TablePaths,
) -> Result<Option<(QuorumStatus, i32)>> {
    match session.get(&table.quorum_status()).await {
        Ok((data, stat)) => Ok(Some((QuorumStatus::from_json(&data)?, stat.version))),
        Err(CoordError::NoNode(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Add `replica`'s acknowledgement for `part_name`. When the quorum fills,
/// the status node is cleared and `last_part` advances, atomically. Retries
/// version conflicts in place.
pub async fn update_quorum(
    session: &dyn CoordSession,
    table: &TablePaths,
    replica: &str,
    part_name: &str,
) -> Result<()> {
    loop {
        let Some((mut status, version)) = read_status(session, table).await? else {
            return Ok(());
        };
        if status.part_name != part_name {
            // A different quorum write is in flight; nothing to ack.
            return Ok(());
        }
        if !status.replicas.insert(replica.to_string()) {
            return Ok(());
        }

        let result = if status.is_satisfied() {
            finish_quorum(session, table, &status, version).await
        } else {
            session
                .set(&table.quorum_status(), status.to_json(), Some(version))
                .await
                .map(|_| ())
                .map_err(EngineError::from)
        };
        match result {
            Ok(()) => return Ok(()),
            Err(EngineError::VersionConflict(_)) => continue,
            Err(EngineError::Coordinator(CoordError::NoNode(_))) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

async fn finish_quorum(
    session: &dyn CoordSession,
    table: &TablePaths,
    status: &QuorumStatus,
    version: i32,
) -> Result<()> {
    let info = PartInfo::parse(&status.part_name)?;
    let last_part_path = table.quorum_last_part(&info.partition_id);

    let mut ops = vec![
        Op::Check {
            path: table.quorum_status(),
            version,
        },
        Op::Delete {
            path: table.quorum_status(),
            version: Some(version),
        },
    ];
    match session.get(&last_part_path).await {
        Ok((data, stat)) => {
            // last_part never regresses.
            let current = PartInfo::parse(&String::from_utf8_lossy(&data))?;
            if current.max_block >= info.max_block {
                return session
                    .multi(ops)
                    .await
                    .map(|_| ())
                    .map_err(EngineError::from);
            }
            ops.push(Op::Set {
                path: last_part_path,
                data: status.part_name.clone().into_bytes(),
                version: Some(stat.version),
            });
        }
        Err(CoordError::NoNode(_)) => {
            ops.push(Op::Create {
                path: last_part_path,
                data: status.part_name.clone().into_bytes(),
                mode: CreateMode::Persistent,
            });
        }
        Err(err) => return Err(err.into()),
    }
    session.multi(ops).await?;
    Ok(())
}

/// The per-partition block ceiling for sequentially-consistent reads: blocks
/// past the ceiling are not yet quorum-committed. The in-flight quorum part,
/// if any, caps its partition below its own min_block.
pub async fn max_added_blocks(
    session: &dyn CoordSession,
    table: &TablePaths,
) -> Result<BTreeMap<String, i64>> {
    let mut ceilings = BTreeMap::new();
    let dir = table.quorum_last_part_dir();
    let partitions = match session.children(&dir).await {
        Ok(partitions) => partitions,
        Err(CoordError::NoNode(_)) => Vec::new(),
        Err(err) => return Err(err.into()),
    };
    for partition in partitions {
        let (data, _) = match session.get(&format!("{dir}/{partition}")).await {
            Ok(found) => found,
            Err(CoordError::NoNode(_)) => continue,
            Err(err) => return Err(err.into()),
        };
        let info = PartInfo::parse(&String::from_utf8_lossy(&data))?;
        ceilings.insert(partition, info.max_block);
    }

    if let Some((status, _)) = read_status(session, table).await? {
        let info = PartInfo::parse(&status.part_name)?;
        let cap = info.min_block - 1;
        ceilings
            .entry(info.partition_id)
            .and_modify(|c| *c = (*c).min(cap))
            .or_insert(cap);
    }
    Ok(ceilings)
}

/// Resolve a quorum record orphaned by its producer's session loss: complete
/// it if this replica holds the part, invalidate it when no replica does.
pub async fn resolve_orphaned(
    session: &dyn CoordSession,
    table: &TablePaths,
    replica: &str,
    holds_part: impl Fn(&str) -> bool,
) -> Result<()> {
    let Some((status, version)) = read_status(session, table).await? else {
        return Ok(());
    };
    if holds_part(&status.part_name) {
        return update_quorum(session, table, replica, &status.part_name).await;
    }

    // Someone may still hold it; invalidate only when nobody does.
    let replicas = session.children(&table.replicas_dir()).await?;
    for other in replicas {
        let part_path = table.part(&other, &status.part_name);
        if session.exists(&part_path).await?.is_some() {
            return Ok(());
        }
    }
    tracing::warn!(
        part = %status.part_name,
        "invalidating orphaned quorum record; part exists on no replica"
    );
    match session
        .delete(&table.quorum_status(), Some(version))
        .await
    {
        Ok(()) | Err(CoordError::NoNode(_)) | Err(CoordError::BadVersion { .. }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
