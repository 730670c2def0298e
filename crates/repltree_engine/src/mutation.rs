//! Mutation entries (ALTER DELETE / ALTER UPDATE).
//!
//! A mutation is a table-wide rewrite: every part whose blocks predate the
//! mutation's per-partition block snapshot is rewritten with the mutation
//! version as its name suffix. Entries live under `/mutations/` named by a
//! sequential index; that index is the mutation version.

use std::collections::BTreeMap;

use crate::error::{EngineError, Result};
use crate::part::PartInfo;
use crate::unix_time_secs;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationCommand {
    Delete { predicate: String },
    Update { column: String, expression: String, predicate: String },
}

/// One entry under `/mutations/NNNNNNNNNN`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationEntry {
    pub create_time: u64,
    pub source_replica: String,
    /// Per-partition block-number fence: parts with `max_block` at or below
    /// the fence are subject to this mutation.
    pub block_numbers: BTreeMap<String, i64>,
    pub commands: Vec<MutationCommand>,
}

impl MutationEntry {
    pub fn new(
        source_replica: &str,
        block_numbers: BTreeMap<String, i64>,
        commands: Vec<MutationCommand>,
    ) -> Self {
        Self {
            create_time: unix_time_secs(),
            source_replica: source_replica.to_string(),
            block_numbers,
            commands,
        }
    }

    /// The mutation's version in `partition` is its block-number fence
    /// there: parts rewritten by this mutation carry it as their suffix.
    pub fn version_in(&self, partition_id: &str) -> Option<i64> {
        self.block_numbers.get(partition_id).copied()
    }

    /// Does `part` still need this mutation? Its blocks must predate the
    /// fence and its current mutation suffix must be older.
    pub fn applies_to(&self, part: &PartInfo) -> bool {
        match self.block_numbers.get(&part.partition_id) {
            Some(fence) => part.max_block <= *fence && part.mutation.unwrap_or(0) < *fence,
            None => false,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("format version: {FORMAT_VERSION}\n"));
        out.push_str(&format!("create_time: {}\n", self.create_time));
        out.push_str(&format!("source replica: {}\n", self.source_replica));
        out.push_str("block_numbers:\n");
        for (partition, fence) in &self.block_numbers {
            out.push_str(&format!("{partition}={fence}\n"));
        }
        out.push_str("commands:\n");
        for command in &self.commands {
            match command {
                MutationCommand::Delete { predicate } => {
                    out.push_str(&format!("delete where {predicate}\n"));
                }
                MutationCommand::Update {
                    column,
                    expression,
                    predicate,
                } => {
                    out.push_str(&format!("update {column} = {expression} where {predicate}\n"));
                }
            }
        }
        out.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let bad = |what: &str| {
            EngineError::LogicalInvariantViolated(format!("malformed mutation entry: {what}"))
        };
        let text = std::str::from_utf8(data).map_err(|_| bad("not utf-8"))?;
        let mut lines = text.lines();
        lines
            .next()
            .and_then(|l| l.strip_prefix("format version: "))
            .and_then(|v| v.trim().parse::<u32>().ok())
            .ok_or_else(|| bad("missing format header"))?;
        let create_time = lines
            .next()
            .and_then(|l| l.strip_prefix("create_time: "))
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| bad("create_time"))?;
        let source_replica = lines
            .next()
            .and_then(|l| l.strip_prefix("source replica: "))
            .map(|v| v.trim().to_string())
            .ok_or_else(|| bad("source replica"))?;
        if lines.next() != Some("block_numbers:") {
            return Err(bad("expected block_numbers"));
        }
        let mut block_numbers = BTreeMap::new();
        let mut commands = Vec::new();
        let mut in_commands = false;
        for line in lines {
            if line == "commands:" {
                in_commands = true;
                continue;
            }
            if !in_commands {
                let (partition, fence) = line.split_once('=').ok_or_else(|| bad("block fence"))?;
                block_numbers.insert(
                    partition.to_string(),
                    fence.parse().map_err(|_| bad("block fence value"))?,
                );
            } else if let Some(rest) = line.strip_prefix("delete where ") {
                commands.push(MutationCommand::Delete {
                    predicate: rest.to_string(),
                });
            } else if let Some(rest) = line.strip_prefix("update ") {
                let (assignment, predicate) =
                    rest.split_once(" where ").ok_or_else(|| bad("update"))?;
                let (column, expression) =
                    assignment.split_once(" = ").ok_or_else(|| bad("update assignment"))?;
                commands.push(MutationCommand::Update {
                    column: column.to_string(),
                    expression: expression.to_string(),
                    predicate: predicate.to_string(),
                });
            }
            // Unknown command forms from newer writers are skipped.
        }
        Ok(Self {
            create_time,
            source_replica,
            block_numbers,
            commands,
        })
    }
}

/// Monitoring view of one mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationStatus {
    pub znode_name: String,
    pub create_time: u64,
    pub parts_remaining: usize,
    pub is_done: bool,
}

/// All mutation entries, keyed by their sequential index (creation order).
pub async fn load_all(
    session: &dyn repltree_coord::CoordSession,
    table: &repltree_coord::TablePaths,
) -> Result<BTreeMap<u64, MutationEntry>> {
    use repltree_coord::CoordError;

    let dir = table.mutations_dir();
    let names = match session.children(&dir).await {
        Ok(names) => names,
        Err(CoordError::NoNode(_)) => return Ok(BTreeMap::new()),
        Err(err) => return Err(err.into()),
    };
    let mut out = BTreeMap::new();
    for name in names {
        let Some(seq) = repltree_coord::paths::sequential_index(&name) else {
            continue;
        };
        let (data, _) = match session.get(&format!("{dir}/{name}")).await {
            Ok(found) => found,
            Err(CoordError::NoNode(_)) => continue,
            Err(err) => return Err(err.into()),
        };
        out.insert(seq, MutationEntry::from_bytes(&data)?);
    }
    Ok(out)
}
