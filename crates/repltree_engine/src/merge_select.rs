//! Leader-side selection of merges and mutations.
//!
//! Candidates are parts that are committed locally *and* still present in
//! the queue's virtual-part set: a part consumed by any pending MERGE,
//! MUTATE or DROP_RANGE has already left the virtual set, so proposals can
//! never overlap unfinished work. Size-tiered, bounded by free disk and the
//! queue's unfinished-merge cap.

use std::collections::BTreeMap;

use repltree_coord::{CoordSession, CreateMode, TablePaths};

use crate::error::Result;
use crate::log_entry::LogEntry;
use crate::mutation::MutationEntry;
use crate::part::{ActivePartSet, PartInfo};
use crate::settings::TableSettings;

/// One unit of work the leader wants in the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeDecision {
    Merge {
        sources: Vec<PartInfo>,
        target: PartInfo,
    },
    Mutate {
        source: PartInfo,
        target: PartInfo,
        version: i64,
    },
}

pub struct MergeSelector {
    paths: TablePaths,
    replica_name: String,
    settings: TableSettings,
}

impl MergeSelector {
    pub fn new(paths: TablePaths, replica_name: &str, settings: TableSettings) -> Self {
        Self {
            paths,
            replica_name: replica_name.to_string(),
            settings,
        }
    }

    /// Pick work for one selection pass.
    ///
    /// `part_size` reports a part's on-disk byte size; `merges_in_queue` is
    /// the current number of unfinished MERGE/MUTATE queue entries.
    pub fn select(
        &self,
        local_parts: &ActivePartSet,
        virtual_parts: &ActivePartSet,
        mutations: &BTreeMap<u64, MutationEntry>,
        merges_in_queue: usize,
        free_space: u64,
        part_size: impl Fn(&PartInfo) -> u64,
    ) -> Vec<MergeDecision> {
        let mut decisions = Vec::new();
        let mut budget = self
            .settings
            .max_replicated_merges_in_queue
            .saturating_sub(merges_in_queue);
        if budget == 0 {
            return decisions;
        }

        // A part is a candidate while nothing queued consumes it.
        let candidate = |part: &PartInfo| virtual_parts.contains_exact(part);

        let partitions: Vec<String> = local_parts.partitions().cloned().collect();
        'partitions: for partition in &partitions {
            // Runs of block-adjacent candidates; a consumed part or a
            // block-number gap breaks the run. Gaps hide unresolved
            // allocations (aborted inserts, drop fences) that a merge must
            // never bridge.
            let mut runs: Vec<Vec<&PartInfo>> = Vec::new();
            let mut run: Vec<&PartInfo> = Vec::new();
            for part in local_parts.partition_parts(partition) {
                if candidate(part) {
                    let adjacent = run
                        .last()
                        .map(|prev: &&PartInfo| prev.max_block + 1 == part.min_block)
                        .unwrap_or(true);
                    if !adjacent || run.len() == self.settings.max_parts_per_merge {
                        runs.push(std::mem::take(&mut run));
                    }
                    run.push(part);
                } else if !run.is_empty() {
                    runs.push(std::mem::take(&mut run));
                }
            }
            if !run.is_empty() {
                runs.push(run);
            }

            for run in runs {
                if run.len() < 2 {
                    continue;
                }
                let total: u64 = run.iter().map(|p| part_size(p)).sum();
                // Merging needs scratch space for the merged copy.
                if total > self.settings.max_merge_total_size
                    || total.saturating_mul(2) > free_space
                {
                    continue;
                }
                let sources: Vec<PartInfo> = run.into_iter().cloned().collect();
                if let Ok(target) = PartInfo::merged(&sources) {
                    decisions.push(MergeDecision::Merge { sources, target });
                    budget -= 1;
                    if budget == 0 {
                        break 'partitions;
                    }
                }
            }
        }

        if budget == 0 {
            return decisions;
        }

        // Parts whose mutation suffix lags a fence get a MUTATE each.
        for entry in mutations.values() {
            for part in local_parts.parts() {
                if !candidate(part) || !entry.applies_to(part) {
                    continue;
                }
                let Some(version) = entry.version_in(&part.partition_id) else {
                    continue;
                };
                // Skip parts just chosen for a merge above.
                let in_merge = decisions.iter().any(|d| match d {
                    MergeDecision::Merge { sources, .. } => sources.contains(part),
                    MergeDecision::Mutate { source, .. } => source == part,
                });
                if in_merge {
                    continue;
                }
                decisions.push(MergeDecision::Mutate {
                    source: part.clone(),
                    target: part.mutated(version),
                    version,
                });
                budget -= 1;
                if budget == 0 {
                    return decisions;
                }
            }
        }

        decisions
    }

    /// Write one decision into the shared log. Sources are verified to still
    /// be registered for this replica right before the append; a vanished
    /// source drops the proposal.
    pub async fn propose(
        &self,
        session: &dyn CoordSession,
        decision: &MergeDecision,
    ) -> Result<Option<String>> {
        let (entry, sources) = match decision {
            MergeDecision::Merge { sources, target } => (
                LogEntry::merge(
                    &self.replica_name,
                    sources.iter().map(|p| p.name()).collect(),
                    target.name(),
                ),
                sources.clone(),
            ),
            MergeDecision::Mutate {
                source,
                target,
                version,
            } => (
                LogEntry::mutate(&self.replica_name, source.name(), target.name(), *version),
                vec![source.clone()],
            ),
        };

        for source in &sources {
            let path = self.paths.part(&self.replica_name, &source.name());
            if session.exists(&path).await?.is_none() {
                tracing::debug!(
                    part = %source.name(),
                    "source part no longer registered; dropping merge proposal"
                );
                return Ok(None);
            }
        }

        let created = session
            .create(
                &self.paths.log_entry_prefix(),
                entry.to_bytes(),
                CreateMode::PersistentSequential,
            )
            .await?;
        tracing::info!(
            target = %entry.new_part_name,
            log_node = %created,
            "proposed log entry"
        );
        Ok(Some(created))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(name: &str) -> PartInfo {
        PartInfo::parse(name).unwrap()
    }

    fn selector() -> MergeSelector {
        MergeSelector::new(TablePaths::new("/tables/t"), "A", TableSettings::default())
    }

    fn set(names: &[&str]) -> ActivePartSet {
        ActivePartSet::from_parts(names.iter().map(|n| part(n)))
    }

    #[test]
    fn merges_adjacent_runs() {
        let local = set(&["2024_0_0_0", "2024_1_1_0", "2024_2_2_0"]);
        let decisions = selector().select(
            &local,
            &local,
            &BTreeMap::new(),
            0,
            u64::MAX,
            |_| 1024,
        );
        assert_eq!(decisions.len(), 1);
        match &decisions[0] {
            MergeDecision::Merge { sources, target } => {
                assert_eq!(sources.len(), 3);
                assert_eq!(target.name(), "2024_0_2_1");
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn parts_consumed_by_pending_work_are_not_touched() {
        let local = set(&["2024_0_0_0", "2024_1_1_0", "2024_2_2_0"]);
        // A pending merge of parts 0..1 replaced them in the virtual set.
        let mut virtual_parts = set(&["2024_2_2_0"]);
        virtual_parts.add(part("2024_0_1_1"));

        let decisions = selector().select(
            &local,
            &virtual_parts,
            &BTreeMap::new(),
            0,
            u64::MAX,
            |_| 1024,
        );
        assert!(decisions.is_empty(), "only part 2 is free and a run of one never merges");
    }

    #[test]
    fn merges_never_bridge_block_gaps() {
        let local = set(&["2024_0_0_0", "2024_1_1_0", "2024_3_3_0"]);
        let decisions = selector().select(
            &local,
            &local,
            &BTreeMap::new(),
            0,
            u64::MAX,
            |_| 1,
        );
        assert_eq!(decisions.len(), 1);
        match &decisions[0] {
            MergeDecision::Merge { sources, target } => {
                assert_eq!(sources.len(), 2);
                assert_eq!(target.name(), "2024_0_1_1");
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn free_space_bounds_merges() {
        let local = set(&["2024_0_0_0", "2024_1_1_0"]);
        let decisions = selector().select(
            &local,
            &local,
            &BTreeMap::new(),
            0,
            1024,
            |_| 1024,
        );
        assert!(decisions.is_empty(), "2x scratch space is not available");
    }

    #[test]
    fn queue_cap_limits_proposals() {
        let local = set(&["2024_0_0_0", "2024_1_1_0"]);
        let settings = TableSettings {
            max_replicated_merges_in_queue: 4,
            ..TableSettings::default()
        };
        let selector = MergeSelector::new(TablePaths::new("/tables/t"), "A", settings);
        let decisions = selector.select(&local, &local, &BTreeMap::new(), 4, u64::MAX, |_| 1);
        assert!(decisions.is_empty());
    }

    #[test]
    fn lagging_parts_get_mutations() {
        let local = set(&["2024_0_0_0"]);
        let mut fences = BTreeMap::new();
        fences.insert("2024".to_string(), 10);
        let mut mutations = BTreeMap::new();
        mutations.insert(0u64, MutationEntry::new("A", fences, vec![]));

        let decisions = selector().select(&local, &local, &mutations, 0, u64::MAX, |_| 1);
        assert_eq!(
            decisions,
            vec![MergeDecision::Mutate {
                source: part("2024_0_0_0"),
                target: part("2024_0_0_0_10"),
                version: 10,
            }]
        );
    }
}
