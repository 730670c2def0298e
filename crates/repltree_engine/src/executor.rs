//! Queue execution: fetch, merge, mutate, drop, clear, replace.
//!
//! Pulls executable entries from the replication queue and drives the local
//! store and the part-exchange client. Returns a coarse task result so the
//! processing pool can decide whether to re-arm immediately or back off.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;

use repltree_coord::{CoordError, CoordSession, CreateMode, Op, TablePaths};

use crate::action_lock::{ActionKind, ActionLocks};
use crate::error::{EngineError, Result};
use crate::exchange::Fetcher;
use crate::log_entry::EntryType;
use crate::part::{ActivePartSet, PartChecksums, PartInfo};
use crate::queue::{ReplicationQueue, SelectedEntry};
use crate::quorum;
use crate::settings::TableSettings;
use crate::storage::{LocalStore, Part};
use crate::unix_time_secs;

/// Outcome of one processing-pool iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskResult {
    Success,
    Error,
    NothingToDo,
}

pub struct QueueExecutor {
    paths: TablePaths,
    replica_name: String,
    settings: TableSettings,
    store: Arc<dyn LocalStore>,
    queue: Arc<ReplicationQueue>,
    fetcher: Fetcher,
    /// Part names currently being fetched; duplicates are rejected.
    fetching: Mutex<HashSet<String>>,
    locks: Arc<ActionLocks>,
    cancel: CancellationToken,
}

impl QueueExecutor {
    pub fn new(
        paths: TablePaths,
        replica_name: &str,
        settings: TableSettings,
        store: Arc<dyn LocalStore>,
        queue: Arc<ReplicationQueue>,
        locks: Arc<ActionLocks>,
        cancel: CancellationToken,
    ) -> Self {
        let fetcher = Fetcher::new(&settings);
        Self {
            paths,
            replica_name: replica_name.to_string(),
            settings,
            store,
            queue,
            fetcher,
            fetching: Mutex::new(HashSet::new()),
            locks,
            cancel,
        }
    }

    pub fn local_parts(&self) -> ActivePartSet {
        ActivePartSet::from_parts(self.store.enumerate_active_parts())
    }

    /// One pool iteration: select, execute, resolve.
    pub async fn queue_task(&self, session: &dyn CoordSession) -> TaskResult {
        if self.locks.is_blocked(ActionKind::QueueDrain) {
            return TaskResult::NothingToDo;
        }
        let local = self.local_parts();
        let selected = match self.queue.select_entry(session, &local).await {
            Ok(Some(selected)) => selected,
            Ok(None) => return TaskResult::NothingToDo,
            Err(err) => {
                if !err.is_session_expired() {
                    tracing::warn!(error = %err, "queue selection failed");
                }
                return TaskResult::Error;
            }
        };

        let gate = match selected.entry.log.entry_type {
            EntryType::Merge | EntryType::Mutate => Some(ActionKind::Merges),
            EntryType::Get | EntryType::ReplaceRange => Some(ActionKind::Fetches),
            _ => None,
        };
        if gate.map(|kind| self.locks.is_blocked(kind)).unwrap_or(false) {
            self.queue.release(&selected);
            return TaskResult::NothingToDo;
        }

        match self.execute(session, &selected).await {
            Ok(()) => match self.queue.mark_success(session, &selected).await {
                Ok(()) => TaskResult::Success,
                Err(err) => {
                    tracing::warn!(error = %err, entry = %selected.znode_name, "entry done but not removable");
                    TaskResult::Error
                }
            },
            Err(err) if err.is_aborted() => {
                tracing::info!(entry = %selected.znode_name, error = %err, "entry aborted");
                self.queue.release(&selected);
                TaskResult::NothingToDo
            }
            Err(EngineError::TooManyConcurrentOperations(reason)) => {
                tracing::debug!(entry = %selected.znode_name, %reason, "entry deferred");
                self.queue.release(&selected);
                TaskResult::NothingToDo
            }
            Err(err) if err.is_session_expired() => {
                self.queue.release(&selected);
                TaskResult::Error
            }
            Err(err) => {
                tracing::warn!(
                    entry = %selected.znode_name,
                    entry_type = ?selected.entry.log.entry_type,
                    error = %err,
                    "queue entry failed, will retry with backoff"
                );
                self.queue.mark_failure(&selected, &err);
                TaskResult::Error
            }
        }
    }

    async fn execute(&self, session: &dyn CoordSession, selected: &SelectedEntry) -> Result<()> {
        let entry = &selected.entry.log;
        match entry.entry_type {
            EntryType::Get => self.execute_fetch(session, selected).await,
            EntryType::Merge => self.execute_merge(session, selected).await,
            EntryType::Mutate => self.execute_mutation(session, selected).await,
            EntryType::DropRange => self.execute_drop_range(session, selected).await,
            EntryType::ClearColumn => self.execute_clear_column(session, selected).await,
            EntryType::ReplaceRange => self.execute_replace_range(session, selected).await,
        }
    }

    async fn execute_fetch(&self, session: &dyn CoordSession, selected: &SelectedEntry) -> Result<()> {
        let entry = &selected.entry.log;
        let target = PartInfo::parse(selected.entry.target_part_name())?;

        match self
            .fetch_and_commit(session, &target, entry.quorum, Some(selected))
            .await
        {
            Ok(()) => Ok(()),
            Err(EngineError::PartNotFound(_)) => {
                // No replica has the part. Old enough entries are declared
                // lost and replaced with an empty placeholder so block
                // numbers keep advancing.
                let age = unix_time_secs().saturating_sub(entry.create_time);
                if age < self.settings.lost_part_grace_period.as_secs() {
                    return Err(EngineError::FetchFailed {
                        replica: String::new(),
                        message: format!("no active replica has part {}", target.name()),
                    });
                }
                tracing::warn!(
                    part = %target.name(),
                    age_secs = age,
                    "part exists on no replica; committing empty placeholder"
                );
                let placeholder = Part::empty(target);
                self.commit_fetched(session, placeholder, None).await
            }
            Err(err) => Err(err),
        }
    }

    /// Locate a replica holding `target` (or a covering part), download it
    /// and commit it locally and in the coordinator.
    async fn fetch_and_commit(
        &self,
        session: &dyn CoordSession,
        target: &PartInfo,
        quorum: usize,
        selected: Option<&SelectedEntry>,
    ) -> Result<()> {
        let target_name = target.name();
        {
            let mut fetching = self.fetching.lock().unwrap();
            if fetching.len() >= self.settings.max_parallel_fetches_per_table {
                return Err(EngineError::TooManyConcurrentOperations(format!(
                    "{} parallel fetches already running",
                    fetching.len()
                )));
            }
            if !fetching.insert(target_name.clone()) {
                return Err(EngineError::TooManyConcurrentOperations(format!(
                    "part {target_name} is already being fetched"
                )));
            }
        }
        let result = self
            .fetch_and_commit_inner(session, target, quorum, selected)
            .await;
        self.fetching.lock().unwrap().remove(&target_name);
        result
    }

    async fn fetch_and_commit_inner(
        &self,
        session: &dyn CoordSession,
        target: &PartInfo,
        quorum: usize,
        selected: Option<&SelectedEntry>,
    ) -> Result<()> {
        let Some((replica, found_name)) = self
            .find_replica_having_covering_part(session, target)
            .await?
        else {
            return Err(EngineError::PartNotFound(target.name()));
        };

        let host_path = self.paths.host(&replica);
        let (host_data, _) = session.get(&host_path).await?;
        let host = String::from_utf8_lossy(&host_data).into_owned();

        tracing::debug!(
            part = %found_name,
            requested = %target.name(),
            source = %replica,
            %host,
            "fetching part"
        );

        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(EngineError::Aborted("fetch cancelled by shutdown".into()));
            }
            fetched = self.fetcher.fetch_part(&host, &found_name, false) => fetched,
        };
        let part = match fetched {
            Ok(part) => part,
            Err(EngineError::ChecksumMismatch(what)) => {
                // Damaged source: fail this attempt, a retry picks another
                // replica at random.
                tracing::warn!(source = %replica, part = %what, "fetched part failed checksum");
                return Err(EngineError::ChecksumMismatch(what));
            }
            Err(err) => return Err(err),
        };

        if found_name != target.name() {
            if let Some(selected) = selected {
                self.queue.set_actual_new_part_name(selected, &found_name);
            }
        }

        let ack_part = if quorum > 0 {
            selected.map(|s| s.entry.log.new_part_name.clone())
        } else {
            None
        };
        self.commit_fetched(session, part, ack_part).await
    }

    /// Register the part in the coordinator, commit it locally, then ack the
    /// quorum if one is being tracked for it.
    async fn commit_fetched(
        &self,
        session: &dyn CoordSession,
        part: Part,
        ack_part: Option<String>,
    ) -> Result<()> {
        let part_path = self.paths.part(&self.replica_name, &part.info.name());
        let ops = vec![Op::Create {
            path: part_path.clone(),
            data: part.checksums.to_json(),
            mode: CreateMode::Persistent,
        }];
        match session.multi(ops).await {
            Ok(_) => {}
            Err(err) if is_node_exists(&err) => {
                // Already registered (crash between multi and local commit,
                // or a concurrent path). Checksums must agree.
                let (data, _) = session.get(&part_path).await?;
                let recorded = PartChecksums::from_json(&data)?;
                if recorded != part.checksums {
                    return Err(EngineError::LogicalInvariantViolated(format!(
                        "part {} registered with different checksums",
                        part.info.name()
                    )));
                }
            }
            Err(err) => return Err(err.into()),
        }

        let name = part.info.name();
        match self.store.commit_part(part) {
            Ok(()) | Err(EngineError::PartAlreadyExists(_)) => {}
            Err(err) => return Err(err),
        }
        tracing::info!(part = %name, "part committed");

        if let Some(ack_part) = ack_part {
            quorum::update_quorum(session, &self.paths, &self.replica_name, &ack_part).await?;
        }
        Ok(())
    }

    /// Prefer an exact holder, else the replica with the largest covering
    /// part. Only active replicas are considered; order is randomized.
    async fn find_replica_having_covering_part(
        &self,
        session: &dyn CoordSession,
        target: &PartInfo,
    ) -> Result<Option<(String, String)>> {
        let mut replicas = session.children(&self.paths.replicas_dir()).await?;
        replicas.shuffle(&mut rand::thread_rng());

        let mut best: Option<(String, PartInfo)> = None;
        for replica in replicas {
            if replica == self.replica_name {
                continue;
            }
            if session
                .exists(&self.paths.is_active(&replica))
                .await?
                .is_none()
            {
                continue;
            }
            let parts = match session.children(&self.paths.parts_dir(&replica)).await {
                Ok(parts) => parts,
                Err(CoordError::NoNode(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            for name in parts {
                let Ok(info) = PartInfo::parse(&name) else {
                    continue;
                };
                if !info.covers(target) {
                    continue;
                }
                if info == *target {
                    return Ok(Some((replica, name)));
                }
                let better = best
                    .as_ref()
                    .map(|(_, current)| info.covers(current))
                    .unwrap_or(true);
                if better {
                    best = Some((replica.clone(), info));
                }
            }
        }
        Ok(best.map(|(replica, info)| (replica, info.name())))
    }

    /// A merge or mutation lost its sources: write a GET for the target into
    /// our own queue and let the original entry complete. The fetch then
    /// retries on the ordinary GET discipline (backoff, replica search,
    /// lost-part placeholder) instead of re-tripping on the gone sources.
    async fn convert_to_fetch(
        &self,
        session: &dyn CoordSession,
        target: &PartInfo,
        missing: &[String],
    ) -> Result<()> {
        let target_name = target.name();
        if self.queue.has_pending_fetch(&target_name) {
            return Ok(());
        }
        let fetch_entry = self
            .queue
            .add_fetch_entry(session, target_name.clone())
            .await?;
        tracing::info!(
            target = %target_name,
            missing = ?missing,
            fetch_entry = %fetch_entry,
            "source parts are gone, converted entry to fetch"
        );
        Ok(())
    }

    async fn execute_merge(&self, session: &dyn CoordSession, selected: &SelectedEntry) -> Result<()> {
        let entry = &selected.entry.log;
        let target = PartInfo::parse(&entry.new_part_name)?;
        let local = self.local_parts();

        let mut missing = Vec::new();
        for source in &entry.source_parts {
            let info = PartInfo::parse(source)?;
            if !local.contains_exact(&info) {
                missing.push(source.clone());
            }
        }
        if !missing.is_empty() {
            // Covered by a later merge on another replica, dropped, or never
            // obtainable here.
            return self.convert_to_fetch(session, &target, &missing).await;
        }

        let merged = match self.store.merge_parts(&entry.source_parts, &target) {
            Ok(merged) => merged,
            // A source vanished mid-merge.
            Err(EngineError::PartNotFound(name)) => {
                return self
                    .convert_to_fetch(session, &target, std::slice::from_ref(&name))
                    .await;
            }
            Err(err) => return Err(err),
        };
        if merged.info != target {
            return Err(EngineError::LogicalInvariantViolated(format!(
                "merge produced {} instead of {}",
                merged.info.name(),
                target.name()
            )));
        }
        self.commit_merged(session, merged, &entry.source_parts).await
    }

    async fn execute_mutation(
        &self,
        session: &dyn CoordSession,
        selected: &SelectedEntry,
    ) -> Result<()> {
        let entry = &selected.entry.log;
        let target = PartInfo::parse(&entry.new_part_name)?;
        let version = entry.mutation_version.unwrap_or(0);
        let source = entry
            .source_parts
            .first()
            .ok_or_else(|| EngineError::LogicalInvariantViolated("mutate without source".into()))?;

        // Commits like a merge, so a vanished source converts to a fetch of
        // the mutated part the same way.
        let source_info = PartInfo::parse(source)?;
        if !self.local_parts().contains_exact(&source_info) {
            return self
                .convert_to_fetch(session, &target, std::slice::from_ref(source))
                .await;
        }

        // The mutation is identified by its fence in this partition.
        let mutations = crate::mutation::load_all(session, &self.paths).await?;
        let Some(commands) = mutations
            .values()
            .find(|m| m.version_in(&target.partition_id) == Some(version))
            .map(|m| m.commands.clone())
        else {
            // Mutation was killed; the entry is obsolete.
            tracing::warn!(version, "mutation entry gone, skipping");
            return Ok(());
        };

        let mutated = match self.store.mutate_part(source, &target, &commands) {
            Ok(mutated) => mutated,
            // The source vanished between the check and the rewrite.
            Err(EngineError::PartNotFound(name)) => {
                return self
                    .convert_to_fetch(session, &target, std::slice::from_ref(&name))
                    .await;
            }
            Err(err) => return Err(err),
        };
        self.commit_merged(session, mutated, std::slice::from_ref(source))
            .await
    }

    /// Commit a locally-built part: register it and drop the consumed
    /// sources from this replica's part list in one multi.
    async fn commit_merged(
        &self,
        session: &dyn CoordSession,
        part: Part,
        consumed: &[String],
    ) -> Result<()> {
        let mut ops = vec![Op::Create {
            path: self.paths.part(&self.replica_name, &part.info.name()),
            data: part.checksums.to_json(),
            mode: CreateMode::Persistent,
        }];
        for source in consumed {
            ops.push(Op::Delete {
                path: self.paths.part(&self.replica_name, source),
                version: None,
            });
        }
        match session.multi(ops).await {
            Ok(_) => {}
            Err(err) if is_node_exists(&err) => {
                // Replay after a crash between the multi and the local
                // commit. Checksums must agree; the sources may already be
                // unregistered.
                let part_path = self.paths.part(&self.replica_name, &part.info.name());
                let (data, _) = session.get(&part_path).await?;
                if PartChecksums::from_json(&data)? != part.checksums {
                    return Err(EngineError::LogicalInvariantViolated(format!(
                        "part {} registered with different checksums",
                        part.info.name()
                    )));
                }
                for source in consumed {
                    repltree_coord::delete_if_exists(
                        session,
                        &self.paths.part(&self.replica_name, source),
                    )
                    .await?;
                }
            }
            Err(err) => return Err(err.into()),
        }
        let name = part.info.name();
        match self.store.commit_part(part) {
            Ok(()) | Err(EngineError::PartAlreadyExists(_)) => {}
            Err(err) => return Err(err),
        }
        tracing::info!(part = %name, "merged part committed");
        Ok(())
    }

    async fn execute_drop_range(
        &self,
        session: &dyn CoordSession,
        selected: &SelectedEntry,
    ) -> Result<()> {
        let entry = &selected.entry.log;
        let range = PartInfo::parse(&entry.new_part_name)?;

        // Entries that would produce parts inside the range are obsolete.
        self.queue.remove_covered_entries(session, &range).await?;

        let local = self.local_parts();
        let doomed: Vec<String> = local
            .intersecting(&range)
            .into_iter()
            .filter(|p| range.covers(p))
            .map(|p| p.name())
            .collect();

        if !doomed.is_empty() {
            let mut ops = Vec::with_capacity(doomed.len());
            for name in &doomed {
                ops.push(Op::Delete {
                    path: self.paths.part(&self.replica_name, name),
                    version: None,
                });
            }
            match session.multi(ops).await {
                Ok(_) => {}
                // A part already unregistered elsewhere; drop one by one.
                Err(err) if is_no_node(&err) => {
                    for name in &doomed {
                        repltree_coord::delete_if_exists(
                            session,
                            &self.paths.part(&self.replica_name, name),
                        )
                        .await?;
                    }
                }
                Err(err) => return Err(err.into()),
            }
            for name in &doomed {
                let result = if entry.detach {
                    self.store.rename_and_detach(name)
                } else {
                    self.store.remove_part(name)
                };
                match result {
                    Ok(()) | Err(EngineError::PartNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        self.queue.remove_virtual_covered_by(&range);
        tracing::info!(
            range = %range.name(),
            parts = doomed.len(),
            detach = entry.detach,
            "drop range executed"
        );
        Ok(())
    }

    async fn execute_clear_column(
        &self,
        session: &dyn CoordSession,
        selected: &SelectedEntry,
    ) -> Result<()> {
        let entry = &selected.entry.log;
        let range = PartInfo::parse(&entry.new_part_name)?;
        let column = entry
            .column_name
            .as_deref()
            .ok_or_else(|| EngineError::LogicalInvariantViolated("clear without column".into()))?;

        let local = self.local_parts();
        let affected: Vec<PartInfo> = local
            .intersecting(&range)
            .into_iter()
            .filter(|p| range.covers(p))
            .cloned()
            .collect();

        for info in affected {
            let name = info.name();
            let rewritten = self.store.clear_column(&name, &info, column)?;
            session
                .set(
                    &self.paths.part(&self.replica_name, &name),
                    rewritten.checksums.to_json(),
                    None,
                )
                .await?;
            self.store.remove_part(&name)?;
            self.store.commit_part(rewritten)?;
            tracing::debug!(part = %name, column, "column cleared");
        }
        Ok(())
    }

    async fn execute_replace_range(
        &self,
        session: &dyn CoordSession,
        selected: &SelectedEntry,
    ) -> Result<()> {
        let entry = &selected.entry.log;
        let range = PartInfo::parse(&entry.new_part_name)?;

        // Drop what the range covers, then bring in the replacements.
        self.queue.remove_covered_entries(session, &range).await?;
        let local = self.local_parts();
        for part in local.intersecting(&range) {
            if !range.covers(part) {
                continue;
            }
            let name = part.name();
            repltree_coord::delete_if_exists(
                session,
                &self.paths.part(&self.replica_name, &name),
            )
            .await?;
            match self.store.rename_and_detach(&name) {
                Ok(()) | Err(EngineError::PartNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        self.queue.remove_virtual_covered_by(&range);

        let local = self.local_parts();
        for name in &entry.source_parts {
            let info = PartInfo::parse(name)?;
            if local.covering(&info).is_some() {
                continue;
            }
            self.fetch_and_commit(session, &info, 0, None).await?;
        }
        Ok(())
    }
}

fn is_node_exists(err: &CoordError) -> bool {
    matches!(err.unwrap_multi(), CoordError::NodeExists(_))
}

fn is_no_node(err: &CoordError) -> bool {
    matches!(err.unwrap_multi(), CoordError::NoNode(_))
}
