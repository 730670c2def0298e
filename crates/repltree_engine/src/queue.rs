//! Per-replica replication queue.
//!
//! Durably mirrors the shared log under `/replicas/<me>/queue/`, keeps the
//! in-memory executability index and the virtual-part set, and enforces the
//! execution discipline: log order for non-commuting entries, conflict
//! postponement, retry backoff, obsolete-merge disposal.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use repltree_coord::{paths, CoordError, CoordSession, CreateMode, Op, TablePaths};

use crate::error::{EngineError, Result};
use crate::log_entry::{EntryType, LogEntry, QueueEntry, QueueEntryState};
use crate::part::{ActivePartSet, PartInfo};
use crate::unix_time_ms;

/// Retry backoff bounds for failed entries.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    fn delay_ms(&self, num_tries: u32) -> u64 {
        let base = self.base.as_millis().max(1) as u64;
        let max = self.max.as_millis().max(1) as u64;
        base.saturating_mul(1u64 << num_tries.min(20)).min(max)
    }
}

struct QueueInner {
    entries: BTreeMap<String, QueueEntry>,
    virtual_parts: ActivePartSet,
    log_pointer: u64,
    /// znode name -> reason the entry was most recently passed over.
    postponed: BTreeMap<String, String>,
    /// Ranges of entries currently being executed.
    executing_ranges: Vec<(String, PartInfo)>,
}

/// Handle to an entry picked for execution. The caller must resolve it with
/// `mark_success`, `mark_failure` or `release`.
#[derive(Clone, Debug)]
pub struct SelectedEntry {
    pub znode_name: String,
    pub entry: QueueEntry,
}

pub struct ReplicationQueue {
    paths: TablePaths,
    replica_name: String,
    backoff: BackoffPolicy,
    inner: Mutex<QueueInner>,
}

impl ReplicationQueue {
    pub fn new(paths: TablePaths, replica_name: &str, backoff: BackoffPolicy) -> Self {
        Self {
            paths,
            replica_name: replica_name.to_string(),
            backoff,
            inner: Mutex::new(QueueInner {
                entries: BTreeMap::new(),
                virtual_parts: ActivePartSet::new(),
                log_pointer: 0,
                postponed: BTreeMap::new(),
                executing_ranges: Vec::new(),
            }),
        }
    }

    pub fn replica_name(&self) -> &str {
        &self.replica_name
    }

    /// Rebuild in-memory state from the coordinator: queue children, the log
    /// pointer, and the virtual-part set seeded from the local active parts.
    pub async fn load(
        &self,
        session: &dyn CoordSession,
        local_parts: &ActivePartSet,
    ) -> Result<()> {
        let queue_dir = self.paths.queue_dir(&self.replica_name);
        let mut names = session.children(&queue_dir).await?;
        names.sort();

        let mut entries = BTreeMap::new();
        for name in names {
            let path = format!("{queue_dir}/{name}");
            let (data, _) = match session.get(&path).await {
                Ok(found) => found,
                Err(CoordError::NoNode(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            let log = LogEntry::from_bytes(&data)?;
            entries.insert(name.clone(), QueueEntry::new(name, log));
        }

        let pointer_path = self.paths.log_pointer(&self.replica_name);
        let (data, _) = session.get(&pointer_path).await?;
        let log_pointer = parse_pointer(&data);

        let mut inner = self.inner.lock().unwrap();
        inner.virtual_parts = local_parts.clone();
        for entry in entries.values() {
            apply_to_virtual(&mut inner.virtual_parts, &entry.log);
        }
        inner.entries = entries;
        inner.log_pointer = log_pointer;
        inner.postponed.clear();
        inner.executing_ranges.clear();
        tracing::debug!(
            replica = %self.replica_name,
            entries = inner.entries.len(),
            log_pointer = inner.log_pointer,
            "replication queue loaded"
        );
        Ok(())
    }

    /// Copy new shared-log entries into this replica's queue and advance the
    /// log pointer, atomically. Re-running with an unchanged log is a no-op.
    pub async fn pull_logs_to_queue(&self, session: &dyn CoordSession) -> Result<usize> {
        let pointer_path = self.paths.log_pointer(&self.replica_name);
        let (pointer_data, pointer_stat) = session.get(&pointer_path).await?;
        let log_pointer = parse_pointer(&pointer_data);

        let log_dir = self.paths.log_dir();
        let mut log_names = session.children(&log_dir).await?;
        log_names.sort();

        let mut to_copy = Vec::new();
        let mut new_pointer = log_pointer;
        for name in log_names {
            let Some(index) = paths::sequential_index(&name) else {
                continue;
            };
            if index < log_pointer {
                continue;
            }
            let (data, _) = match session.get(&format!("{log_dir}/{name}")).await {
                Ok(found) => found,
                // Cleaned up between listing and read; the pointer was
                // already past it on some replica, so skip.
                Err(CoordError::NoNode(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            let entry = LogEntry::from_bytes(&data)?;
            to_copy.push(entry);
            new_pointer = index + 1;
        }
        if to_copy.is_empty() {
            return Ok(0);
        }

        let mut ops = Vec::with_capacity(to_copy.len() + 2);
        ops.push(Op::Check {
            path: pointer_path.clone(),
            version: pointer_stat.version,
        });
        ops.push(Op::Set {
            path: pointer_path,
            data: new_pointer.to_string().into_bytes(),
            version: Some(pointer_stat.version),
        });
        for entry in &to_copy {
            ops.push(Op::Create {
                path: self.paths.queue_entry_prefix(&self.replica_name),
                data: entry.to_bytes(),
                mode: CreateMode::PersistentSequential,
            });
        }
        let results = session.multi(ops).await?;

        let mut inner = self.inner.lock().unwrap();
        let mut copied = 0;
        for (entry, result) in to_copy.into_iter().zip(results.into_iter().skip(2)) {
            let repltree_coord::OpResult::Created { path } = result else {
                continue;
            };
            let znode_name = path.rsplit('/').next().unwrap_or(&path).to_string();
            apply_to_virtual(&mut inner.virtual_parts, &entry);
            inner.entries.insert(znode_name.clone(), QueueEntry::new(znode_name, entry));
            copied += 1;
        }
        inner.log_pointer = new_pointer;
        tracing::debug!(
            replica = %self.replica_name,
            copied,
            log_pointer = new_pointer,
            "pulled log entries into queue"
        );
        Ok(copied)
    }

    /// Insert a self-generated GET (initial sync, broken-part refetch). Goes
    /// through the coordinator so the entry survives restart.
    pub async fn add_fetch_entry(
        &self,
        session: &dyn CoordSession,
        part_name: String,
    ) -> Result<String> {
        let entry = LogEntry::get("", part_name, None, 0);
        let created = session
            .create(
                &self.paths.queue_entry_prefix(&self.replica_name),
                entry.to_bytes(),
                CreateMode::PersistentSequential,
            )
            .await?;
        let znode_name = created.rsplit('/').next().unwrap_or(&created).to_string();
        let mut inner = self.inner.lock().unwrap();
        apply_to_virtual(&mut inner.virtual_parts, &entry);
        inner
            .entries
            .insert(znode_name.clone(), QueueEntry::new(znode_name.clone(), entry));
        Ok(znode_name)
    }

    /// Pick the next executable entry. Entries already satisfied by a local
    /// covering part are completed on the spot.
    pub async fn select_entry(
        &self,
        session: &dyn CoordSession,
        local_parts: &ActivePartSet,
    ) -> Result<Option<SelectedEntry>> {
        loop {
            let candidate = {
                let mut inner = self.inner.lock().unwrap();
                inner.postponed.clear();
                self.pick_locked(&mut inner, local_parts)
            };
            match candidate {
                Pick::None => return Ok(None),
                Pick::AlreadyDone(znode_name) => {
                    tracing::debug!(
                        replica = %self.replica_name,
                        entry = %znode_name,
                        "queue entry target already present, completing"
                    );
                    self.delete_entry(session, &znode_name).await?;
                    continue;
                }
                Pick::Selected(selected) => return Ok(Some(selected)),
            }
        }
    }

    fn pick_locked(&self, inner: &mut QueueInner, local_parts: &ActivePartSet) -> Pick {
        let now = unix_time_ms();
        let mut postponed = Vec::new();
        let mut picked: Option<SelectedEntry> = None;
        let mut done: Option<String> = None;

        let names: Vec<String> = inner.entries.keys().cloned().collect();
        'entries: for name in &names {
            let entry = &inner.entries[name];
            if entry.state == QueueEntryState::Executing {
                continue;
            }

            let target = match PartInfo::parse(entry.target_part_name()) {
                Ok(target) => target,
                Err(_) => {
                    postponed.push((name.clone(), "unparsable target part".to_string()));
                    continue;
                }
            };

            // Target (or something covering it) already committed locally.
            let produces_part = matches!(
                entry.log.entry_type,
                EntryType::Get | EntryType::Merge | EntryType::Mutate
            );
            if produces_part && local_parts.covering(&target).is_some() {
                done = Some(name.clone());
                break 'entries;
            }

            if entry.backoff_until > now {
                postponed.push((name.clone(), format!(
                    "retry backoff after {} failed attempts",
                    entry.num_tries
                )));
                continue;
            }

            // Log order for non-commuting entries: anything earlier in the
            // queue touching an overlapping range goes first.
            for (other_name, other) in inner.entries.range::<String, _>(..name.clone()) {
                let other_target = match PartInfo::parse(other.target_part_name()) {
                    Ok(target) => target,
                    Err(_) => continue,
                };
                if other_target.intersects(&target) {
                    postponed.push((name.clone(), format!(
                        "waiting for preceding entry {other_name} on an overlapping range"
                    )));
                    continue 'entries;
                }
            }

            // A concurrent operation already runs on an overlapping range.
            for (running, range) in &inner.executing_ranges {
                if range.intersects(&target) {
                    postponed.push((name.clone(), format!(
                        "entry {running} is executing on an overlapping range"
                    )));
                    continue 'entries;
                }
            }

            // No source-presence gate here: source parts overlap the target,
            // so the ordering rules above already hold a merge back while
            // earlier entries can still produce its sources. A source that
            // is missing past this point will never arrive through the log;
            // the executor converts such an entry into a fetch of the
            // target.
            picked = Some(SelectedEntry {
                znode_name: name.clone(),
                entry: entry.clone(),
            });
            break;
        }

        for (name, reason) in postponed {
            inner.postponed.insert(name, reason);
        }
        if let Some(name) = done {
            return Pick::AlreadyDone(name);
        }
        let Some(selected) = picked else {
            return Pick::None;
        };
        let entry = inner.entries.get_mut(&selected.znode_name).expect("picked entry");
        entry.state = QueueEntryState::Executing;
        entry.last_attempt_time = now;
        entry.num_tries += 1;
        if let Ok(target) = PartInfo::parse(entry.target_part_name()) {
            inner
                .executing_ranges
                .push((selected.znode_name.clone(), target));
        }
        Pick::Selected(SelectedEntry {
            entry: entry.clone(),
            ..selected
        })
    }

    /// Entry executed: remove it here and in the coordinator.
    pub async fn mark_success(
        &self,
        session: &dyn CoordSession,
        selected: &SelectedEntry,
    ) -> Result<()> {
        self.delete_entry(session, &selected.znode_name).await
    }

    /// Entry failed: record the exception and schedule a backoff retry.
    pub fn mark_failure(&self, selected: &SelectedEntry, error: &EngineError) {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get_mut(&selected.znode_name) else {
            return;
        };
        entry.state = QueueEntryState::Pending;
        entry.last_exception = Some(error.to_string());
        entry.backoff_until = unix_time_ms() + self.backoff.delay_ms(entry.num_tries);
        let znode = selected.znode_name.clone();
        inner.executing_ranges.retain(|(name, _)| name != &znode);
    }

    /// Put an entry back untouched (shutdown, deferral without penalty).
    pub fn release(&self, selected: &SelectedEntry) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&selected.znode_name) {
            entry.state = QueueEntryState::Pending;
            entry.num_tries = entry.num_tries.saturating_sub(1);
        }
        let znode = selected.znode_name.clone();
        inner.executing_ranges.retain(|(name, _)| name != &znode);
    }

    /// A fetch answered with a covering part: rewrite the entry's target.
    pub fn set_actual_new_part_name(&self, selected: &SelectedEntry, actual: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Ok(info) = PartInfo::parse(actual) {
            inner.virtual_parts.add(info.clone());
            let znode = selected.znode_name.clone();
            for (name, range) in inner.executing_ranges.iter_mut() {
                if *name == znode {
                    *range = info.clone();
                }
            }
        }
        if let Some(entry) = inner.entries.get_mut(&selected.znode_name) {
            entry.actual_new_part_name = Some(actual.to_string());
        }
    }

    async fn delete_entry(&self, session: &dyn CoordSession, znode_name: &str) -> Result<()> {
        let path = format!(
            "{}/{}",
            self.paths.queue_dir(&self.replica_name),
            znode_name
        );
        match session.delete(&path, None).await {
            Ok(()) | Err(CoordError::NoNode(_)) => {}
            Err(err) => return Err(err.into()),
        }
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(znode_name);
        inner
            .executing_ranges
            .retain(|(name, _)| name != znode_name);
        inner.postponed.remove(znode_name);
        Ok(())
    }

    /// Drop queue entries made obsolete by a DROP_RANGE covering them.
    pub async fn remove_covered_entries(
        &self,
        session: &dyn CoordSession,
        range: &PartInfo,
    ) -> Result<usize> {
        let doomed: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .entries
                .iter()
                .filter(|(_, entry)| {
                    entry.state == QueueEntryState::Pending
                        && !matches!(
                            entry.log.entry_type,
                            EntryType::DropRange | EntryType::ReplaceRange
                        )
                        && PartInfo::parse(entry.target_part_name())
                            .map(|target| range.covers(&target))
                            .unwrap_or(false)
                })
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in &doomed {
            self.delete_entry(session, name).await?;
        }
        Ok(doomed.len())
    }

    pub fn virtual_parts(&self) -> ActivePartSet {
        self.inner.lock().unwrap().virtual_parts.clone()
    }

    /// DROP_RANGE executed: virtual parts lose everything the range covers.
    pub fn remove_virtual_covered_by(&self, range: &PartInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner.virtual_parts.remove_covered_by(range);
    }

    pub fn log_pointer(&self) -> u64 {
        self.inner.lock().unwrap().log_pointer
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn postpone_reasons(&self) -> BTreeMap<String, String> {
        self.inner.lock().unwrap().postponed.clone()
    }

    /// Unfinished MERGE/MUTATE entries; bounds the leader's proposals.
    pub fn count_merges_and_mutations(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .filter(|e| matches!(e.log.entry_type, EntryType::Merge | EntryType::Mutate))
            .count()
    }

    /// Is some queue entry going to produce (or fetch) this exact part?
    pub fn is_part_in_flight(&self, part_name: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .any(|e| e.target_part_name() == part_name)
    }

    /// Is a GET for this exact part already queued? Keeps merge-to-fetch
    /// conversion from stacking duplicate fetch entries.
    pub fn has_pending_fetch(&self, part_name: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.entries.values().any(|e| {
            e.log.entry_type == EntryType::Get && e.target_part_name() == part_name
        })
    }

    pub fn status(&self) -> QueueStatus {
        let inner = self.inner.lock().unwrap();
        let mut status = QueueStatus {
            queue_size: inner.entries.len(),
            inserts_in_queue: 0,
            merges_in_queue: 0,
            mutations_in_queue: 0,
            log_pointer: inner.log_pointer,
            oldest_entry_time: None,
        };
        for entry in inner.entries.values() {
            match entry.log.entry_type {
                EntryType::Get => status.inserts_in_queue += 1,
                EntryType::Merge => status.merges_in_queue += 1,
                EntryType::Mutate => status.mutations_in_queue += 1,
                _ => {}
            }
            status.oldest_entry_time = Some(
                status
                    .oldest_entry_time
                    .map_or(entry.log.create_time, |t: u64| t.min(entry.log.create_time)),
            );
        }
        status
    }
}

enum Pick {
    None,
    AlreadyDone(String),
    Selected(SelectedEntry),
}

/// Monitoring snapshot of the queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub inserts_in_queue: usize,
    pub merges_in_queue: usize,
    pub mutations_in_queue: usize,
    pub log_pointer: u64,
    pub oldest_entry_time: Option<u64>,
}

fn parse_pointer(data: &[u8]) -> u64 {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Symbolically apply an entry to the virtual-part set.
fn apply_to_virtual(virtual_parts: &mut ActivePartSet, entry: &LogEntry) {
    match entry.entry_type {
        EntryType::Get | EntryType::Merge | EntryType::Mutate => {
            if let Ok(info) = PartInfo::parse(&entry.new_part_name) {
                virtual_parts.add(info);
            }
        }
        EntryType::DropRange => {
            if let Ok(range) = PartInfo::parse(&entry.new_part_name) {
                virtual_parts.remove_covered_by(&range);
            }
        }
        EntryType::ReplaceRange => {
            if let Ok(range) = PartInfo::parse(&entry.new_part_name) {
                virtual_parts.remove_covered_by(&range);
            }
            for part in &entry.source_parts {
                if let Ok(info) = PartInfo::parse(part) {
                    virtual_parts.add(info);
                }
            }
        }
        // Rewrites parts in place; the block ranges do not change.
        EntryType::ClearColumn => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repltree_coord::{ensure_path, Coordinator, MemoryCoordinator};
    use std::sync::Arc;

    const ROOT: &str = "/tables/t";

    async fn setup() -> (MemoryCoordinator, Arc<dyn CoordSession>, ReplicationQueue) {
        let coord = MemoryCoordinator::new();
        let session = coord.connect().await.unwrap();
        let paths = TablePaths::new(ROOT);
        for dir in [paths.log_dir(), paths.queue_dir("r1")] {
            ensure_path(session.as_ref(), &dir).await.unwrap();
        }
        session
            .create(
                &paths.log_pointer("r1"),
                b"0".to_vec(),
                CreateMode::Persistent,
            )
            .await
            .unwrap();
        let queue = ReplicationQueue::new(
            paths,
            "r1",
            BackoffPolicy {
                base: Duration::from_millis(10),
                max: Duration::from_millis(100),
            },
        );
        (coord, session, queue)
    }

    async fn push_log(session: &dyn CoordSession, entry: &LogEntry) {
        session
            .create(
                &TablePaths::new(ROOT).log_entry_prefix(),
                entry.to_bytes(),
                CreateMode::PersistentSequential,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pull_is_idempotent() {
        let (_coord, session, queue) = setup().await;
        push_log(
            session.as_ref(),
            &LogEntry::get("A", "2024_0_0_0".into(), None, 0),
        )
        .await;
        push_log(
            session.as_ref(),
            &LogEntry::get("A", "2024_1_1_0".into(), None, 0),
        )
        .await;

        assert_eq!(queue.pull_logs_to_queue(session.as_ref()).await.unwrap(), 2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.log_pointer(), 2);
        // Same log state: nothing new.
        assert_eq!(queue.pull_logs_to_queue(session.as_ref()).await.unwrap(), 0);
        assert_eq!(queue.len(), 2);
        assert_eq!(
            session
                .children(&TablePaths::new(ROOT).queue_dir("r1"))
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn select_prefers_oldest_and_respects_order_on_overlap() {
        let (_coord, session, queue) = setup().await;
        push_log(
            session.as_ref(),
            &LogEntry::get("A", "2024_0_0_0".into(), None, 0),
        )
        .await;
        push_log(
            session.as_ref(),
            &LogEntry::merge("A", vec!["2024_0_0_0".into()], "2024_0_0_1".into()),
        )
        .await;
        queue.pull_logs_to_queue(session.as_ref()).await.unwrap();

        let local = ActivePartSet::new();
        let selected = queue
            .select_entry(session.as_ref(), &local)
            .await
            .unwrap()
            .expect("entry");
        assert_eq!(selected.entry.log.new_part_name, "2024_0_0_0");
        // The merge overlaps the in-flight GET: postponed.
        assert!(queue
            .select_entry(session.as_ref(), &local)
            .await
            .unwrap()
            .is_none());
        let reasons = queue.postpone_reasons();
        assert!(reasons.values().any(|r| r.contains("overlapping")));
        queue.release(&selected);
    }

    #[tokio::test]
    async fn entry_with_local_covering_part_completes_immediately() {
        let (_coord, session, queue) = setup().await;
        push_log(
            session.as_ref(),
            &LogEntry::get("A", "2024_0_0_0".into(), None, 0),
        )
        .await;
        queue.pull_logs_to_queue(session.as_ref()).await.unwrap();

        let local = ActivePartSet::from_parts([PartInfo::parse("2024_0_0_1").unwrap()]);
        assert!(queue
            .select_entry(session.as_ref(), &local)
            .await
            .unwrap()
            .is_none());
        assert!(queue.is_empty());
        assert!(session
            .children(&TablePaths::new(ROOT).queue_dir("r1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn merge_follows_its_source_fetches() {
        let (_coord, session, queue) = setup().await;
        push_log(
            session.as_ref(),
            &LogEntry::get("A", "2024_0_0_0".into(), None, 0),
        )
        .await;
        push_log(
            session.as_ref(),
            &LogEntry::get("A", "2024_1_1_0".into(), None, 0),
        )
        .await;
        push_log(
            session.as_ref(),
            &LogEntry::merge(
                "A",
                vec!["2024_0_0_0".into(), "2024_1_1_0".into()],
                "2024_0_1_1".into(),
            ),
        )
        .await;
        queue.pull_logs_to_queue(session.as_ref()).await.unwrap();

        // While the source fetches are still queued, the merge stays behind
        // them in log order.
        let local = ActivePartSet::new();
        let first = queue
            .select_entry(session.as_ref(), &local)
            .await
            .unwrap()
            .expect("source fetch runs first");
        assert_eq!(first.entry.log.entry_type, EntryType::Get);
        assert!(queue
            .postpone_reasons()
            .values()
            .any(|r| r.contains("preceding")));
        queue.release(&first);

        // Sources landed: the GETs complete on the spot and the merge runs.
        let local = ActivePartSet::from_parts([
            PartInfo::parse("2024_0_0_0").unwrap(),
            PartInfo::parse("2024_1_1_0").unwrap(),
        ]);
        let selected = queue
            .select_entry(session.as_ref(), &local)
            .await
            .unwrap()
            .expect("merge now runnable");
        assert_eq!(selected.entry.log.entry_type, EntryType::Merge);
        queue.release(&selected);
    }

    #[tokio::test]
    async fn merge_with_vanished_source_is_still_selected() {
        let (_coord, session, queue) = setup().await;
        push_log(
            session.as_ref(),
            &LogEntry::merge(
                "A",
                vec!["2024_0_0_0".into(), "2024_1_1_0".into()],
                "2024_0_1_1".into(),
            ),
        )
        .await;
        queue.pull_logs_to_queue(session.as_ref()).await.unwrap();

        // Nothing earlier in the queue can produce the missing source, so
        // the entry must reach the executor (which converts it to a fetch)
        // instead of being postponed forever.
        let mut local = ActivePartSet::new();
        local.add(PartInfo::parse("2024_0_0_0").unwrap());
        let selected = queue
            .select_entry(session.as_ref(), &local)
            .await
            .unwrap()
            .expect("merge with a vanished source is executable");
        assert_eq!(selected.entry.log.entry_type, EntryType::Merge);
        queue.release(&selected);
    }

    #[tokio::test]
    async fn failure_schedules_backoff() {
        let (_coord, session, queue) = setup().await;
        push_log(
            session.as_ref(),
            &LogEntry::get("A", "2024_0_0_0".into(), None, 0),
        )
        .await;
        queue.pull_logs_to_queue(session.as_ref()).await.unwrap();

        let local = ActivePartSet::new();
        let selected = queue
            .select_entry(session.as_ref(), &local)
            .await
            .unwrap()
            .expect("entry");
        queue.mark_failure(
            &selected,
            &EngineError::FetchFailed {
                replica: "B".into(),
                message: "connection refused".into(),
            },
        );
        // Within the backoff window the entry is not reselected.
        assert!(queue
            .select_entry(session.as_ref(), &local)
            .await
            .unwrap()
            .is_none());
        assert!(queue
            .postpone_reasons()
            .values()
            .any(|r| r.contains("backoff")));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let again = queue
            .select_entry(session.as_ref(), &local)
            .await
            .unwrap()
            .expect("retried after backoff");
        assert_eq!(again.entry.num_tries, 2);
        queue.release(&again);
    }

    #[tokio::test]
    async fn virtual_parts_track_queue_effects() {
        let (_coord, session, queue) = setup().await;
        push_log(
            session.as_ref(),
            &LogEntry::get("A", "2024_0_0_0".into(), None, 0),
        )
        .await;
        push_log(
            session.as_ref(),
            &LogEntry::get("A", "2024_1_1_0".into(), None, 0),
        )
        .await;
        push_log(
            session.as_ref(),
            &LogEntry::merge(
                "A",
                vec!["2024_0_0_0".into(), "2024_1_1_0".into()],
                "2024_0_1_1".into(),
            ),
        )
        .await;
        queue.pull_logs_to_queue(session.as_ref()).await.unwrap();

        let virtual_parts = queue.virtual_parts();
        assert_eq!(virtual_parts.names(), vec!["2024_0_1_1"]);
    }

    #[tokio::test]
    async fn drop_range_clears_covered_entries() {
        let (_coord, session, queue) = setup().await;
        push_log(
            session.as_ref(),
            &LogEntry::get("A", "2024_0_0_0".into(), None, 0),
        )
        .await;
        let range = PartInfo::covering_range("2024", 100);
        push_log(
            session.as_ref(),
            &LogEntry::drop_range("A", range.name(), false),
        )
        .await;
        queue.pull_logs_to_queue(session.as_ref()).await.unwrap();
        assert!(queue.virtual_parts().is_empty());

        let removed = queue
            .remove_covered_entries(session.as_ref(), &range)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(queue.len(), 1);
    }
}
