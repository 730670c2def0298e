//! Part identity and the covering algebra.
//!
//! A part is an immutable sorted fragment of one partition covering a
//! contiguous block-number range. Its name is its identity:
//! `partition_minBlock_maxBlock_level[_mutation]`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Parsed part identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartInfo {
    pub partition_id: String,
    pub min_block: i64,
    pub max_block: i64,
    pub level: u32,
    /// Mutation version suffix, present on parts produced by MUTATE.
    pub mutation: Option<i64>,
}

impl PartInfo {
    pub fn new(partition_id: impl Into<String>, min_block: i64, max_block: i64, level: u32) -> Self {
        Self {
            partition_id: partition_id.into(),
            min_block,
            max_block,
            level,
            mutation: None,
        }
    }

    /// Parse `partition_min_max_level[_mutation]`. Partition identifiers do
    /// not contain underscores.
    pub fn parse(name: &str) -> Result<Self> {
        let bad = || EngineError::LogicalInvariantViolated(format!("bad part name {name:?}"));
        let fields: Vec<&str> = name.split('_').collect();
        if fields.len() != 4 && fields.len() != 5 {
            return Err(bad());
        }
        let partition_id = fields[0];
        if partition_id.is_empty() {
            return Err(bad());
        }
        let min_block: i64 = fields[1].parse().map_err(|_| bad())?;
        let max_block: i64 = fields[2].parse().map_err(|_| bad())?;
        let level: u32 = fields[3].parse().map_err(|_| bad())?;
        let mutation = match fields.get(4) {
            Some(raw) => Some(raw.parse().map_err(|_| bad())?),
            None => None,
        };
        if min_block > max_block {
            return Err(bad());
        }
        Ok(Self {
            partition_id: partition_id.to_string(),
            min_block,
            max_block,
            level,
            mutation,
        })
    }

    pub fn name(&self) -> String {
        match self.mutation {
            Some(mutation) => format!(
                "{}_{}_{}_{}_{}",
                self.partition_id, self.min_block, self.max_block, self.level, mutation
            ),
            None => format!(
                "{}_{}_{}_{}",
                self.partition_id, self.min_block, self.max_block, self.level
            ),
        }
    }

    /// P covers Q iff same partition and Q's block range is inside P's.
    /// A part covers itself; a mutated part covers its origin but not the
    /// other way around.
    pub fn covers(&self, other: &PartInfo) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.min_block
            && self.max_block >= other.max_block
            && self.level >= other.level
            && self.mutation.unwrap_or(0) >= other.mutation.unwrap_or(0)
    }

    pub fn is_disjoint(&self, other: &PartInfo) -> bool {
        self.partition_id != other.partition_id
            || self.max_block < other.min_block
            || other.max_block < self.min_block
    }

    pub fn intersects(&self, other: &PartInfo) -> bool {
        !self.is_disjoint(other)
    }

    pub fn contains_block(&self, block: i64) -> bool {
        block >= self.min_block && block <= self.max_block
    }

    /// Identity of the part produced by merging `parts` (sorted, adjacent,
    /// same partition).
    pub fn merged(parts: &[PartInfo]) -> Result<PartInfo> {
        let first = parts.first().ok_or_else(|| {
            EngineError::LogicalInvariantViolated("merge of zero parts".into())
        })?;
        let mut min_block = first.min_block;
        let mut max_block = first.max_block;
        let mut level = first.level;
        let mut mutation = first.mutation;
        for part in parts {
            if part.partition_id != first.partition_id {
                return Err(EngineError::LogicalInvariantViolated(format!(
                    "merge across partitions {} and {}",
                    first.partition_id, part.partition_id
                )));
            }
            min_block = min_block.min(part.min_block);
            max_block = max_block.max(part.max_block);
            level = level.max(part.level);
            mutation = mutation.max(part.mutation);
        }
        Ok(PartInfo {
            partition_id: first.partition_id.clone(),
            min_block,
            max_block,
            level: level + 1,
            mutation,
        })
    }

    /// Identity of `self` after applying mutation `version`.
    pub fn mutated(&self, version: i64) -> PartInfo {
        PartInfo {
            mutation: Some(version),
            ..self.clone()
        }
    }

    /// An imaginary part covering every possible part of `partition_id` up to
    /// `max_block` inclusive, mutated or not. Used by DROP_RANGE.
    pub fn covering_range(partition_id: &str, max_block: i64) -> PartInfo {
        PartInfo {
            partition_id: partition_id.to_string(),
            min_block: 0,
            max_block,
            level: u32::MAX,
            mutation: Some(i64::MAX),
        }
    }
}

impl fmt::Display for PartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Per-file crc32 checksums plus sizes; recorded in the coordinator next to
/// the part so replicas can cross-check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartChecksums {
    pub files: BTreeMap<String, FileChecksum>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksum {
    pub size: u64,
    pub crc32: u32,
}

impl PartChecksums {
    pub fn add_file(&mut self, name: impl Into<String>, bytes: &[u8]) {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(bytes);
        self.files.insert(
            name.into(),
            FileChecksum {
                size: bytes.len() as u64,
                crc32: hasher.finalize(),
            },
        );
    }

    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }

    /// One combined checksum over file names, sizes and per-file checksums.
    pub fn combined(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for (name, sum) in &self.files {
            hasher.update(name.as_bytes());
            hasher.update(&sum.size.to_le_bytes());
            hasher.update(&sum.crc32.to_le_bytes());
        }
        hasher.finalize()
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("checksums serialize")
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|err| {
            EngineError::LogicalInvariantViolated(format!("bad checksums record: {err}"))
        })
    }
}

/// What happened when a part was offered to an `ActivePartSet`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Added; these previously-active names are now covered and gone.
    Added { replaced: Vec<String> },
    /// A present part already covers the offered one; set unchanged.
    Covered { by: String },
}

/// The set of active (maximal, non-overlapping) parts, per partition.
///
/// Used twice: for the committed local state and for the queue's virtual
/// parts (the state the table will reach once every queued entry runs).
#[derive(Clone, Debug, Default)]
pub struct ActivePartSet {
    by_partition: BTreeMap<String, BTreeMap<i64, PartInfo>>,
}

impl ActivePartSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(parts: impl IntoIterator<Item = PartInfo>) -> Self {
        let mut set = Self::new();
        for part in parts {
            set.add(part);
        }
        set
    }

    pub fn add(&mut self, part: PartInfo) -> AddOutcome {
        let partition = self
            .by_partition
            .entry(part.partition_id.clone())
            .or_default();
        if let Some(existing) = partition.values().find(|p| p.covers(&part)) {
            return AddOutcome::Covered {
                by: existing.name(),
            };
        }
        let replaced: Vec<i64> = partition
            .values()
            .filter(|p| part.covers(p))
            .map(|p| p.min_block)
            .collect();
        let mut replaced_names = Vec::with_capacity(replaced.len());
        for min_block in replaced {
            if let Some(old) = partition.remove(&min_block) {
                replaced_names.push(old.name());
            }
        }
        partition.insert(part.min_block, part);
        AddOutcome::Added {
            replaced: replaced_names,
        }
    }

    pub fn remove(&mut self, part: &PartInfo) -> bool {
        let Some(partition) = self.by_partition.get_mut(&part.partition_id) else {
            return false;
        };
        match partition.get(&part.min_block) {
            Some(found) if found == part => {
                partition.remove(&part.min_block);
                true
            }
            _ => false,
        }
    }

    /// Drop every active part covered by `range`, returning them.
    pub fn remove_covered_by(&mut self, range: &PartInfo) -> Vec<PartInfo> {
        let Some(partition) = self.by_partition.get_mut(&range.partition_id) else {
            return Vec::new();
        };
        let doomed: Vec<i64> = partition
            .values()
            .filter(|p| range.covers(p))
            .map(|p| p.min_block)
            .collect();
        doomed
            .into_iter()
            .filter_map(|min_block| partition.remove(&min_block))
            .collect()
    }

    pub fn contains_exact(&self, part: &PartInfo) -> bool {
        self.by_partition
            .get(&part.partition_id)
            .and_then(|partition| partition.get(&part.min_block))
            .map(|found| found == part)
            .unwrap_or(false)
    }

    /// Active part covering `part`, if any (including an exact match).
    pub fn covering(&self, part: &PartInfo) -> Option<&PartInfo> {
        self.by_partition
            .get(&part.partition_id)?
            .values()
            .find(|p| p.covers(part))
    }

    /// Active parts intersecting `range`.
    pub fn intersecting(&self, range: &PartInfo) -> Vec<&PartInfo> {
        self.by_partition
            .get(&range.partition_id)
            .map(|partition| {
                partition
                    .values()
                    .filter(|p| p.intersects(range))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn parts(&self) -> impl Iterator<Item = &PartInfo> {
        self.by_partition.values().flat_map(|p| p.values())
    }

    pub fn partition_parts(&self, partition_id: &str) -> Vec<&PartInfo> {
        self.by_partition
            .get(partition_id)
            .map(|p| p.values().collect())
            .unwrap_or_default()
    }

    pub fn partitions(&self) -> impl Iterator<Item = &String> {
        self.by_partition.keys()
    }

    pub fn names(&self) -> Vec<String> {
        self.parts().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_partition.values().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest max_block seen in a partition, if any part exists.
    pub fn max_block(&self, partition_id: &str) -> Option<i64> {
        self.by_partition
            .get(partition_id)?
            .values()
            .map(|p| p.max_block)
            .max()
    }

    /// No two active parts in any partition overlap.
    pub fn check_no_overlap(&self) -> Result<()> {
        for partition in self.by_partition.values() {
            let mut prev: Option<&PartInfo> = None;
            for part in partition.values() {
                if let Some(prev) = prev {
                    if prev.max_block >= part.min_block {
                        return Err(EngineError::LogicalInvariantViolated(format!(
                            "active parts {} and {} overlap",
                            prev.name(),
                            part.name()
                        )));
                    }
                }
                prev = Some(part);
            }
        }
        Ok(())
    }
}
