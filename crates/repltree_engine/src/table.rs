//! One replicated table: assembly, lifecycle, client surface.
//!
//! Owns the coordinator session, the queue and its executor, leader
//! election, the part-exchange server and the supervisory tasks. Partial
//! shutdown (session expiry) parks everything except the restart task, which
//! recovers the session and restarts the rest.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use repltree_coord::{
    ensure_path, CoordError, CoordSession, Coordinator, CreateMode, TablePaths, WatchFuture,
};

use crate::action_lock::{ActionKind, ActionLockGuard, ActionLocks};
use crate::alter::{self, AlterWatcher, TableStructure};
use crate::block_number::{allocate_block_number, AllocatedBlock};
use crate::cleanup::CleanupTask;
use crate::error::{EngineError, Result};
use crate::exchange::ExchangeServer;
use crate::executor::{QueueExecutor, TaskResult};
use crate::leader::{LeaderElection, LeaderState};
use crate::log_entry::LogEntry;
use crate::merge_select::MergeSelector;
use crate::mutation::{self, MutationCommand, MutationEntry};
use crate::part::{ActivePartSet, PartInfo};
use crate::part_check::PartCheckTask;
use crate::queue::{BackoffPolicy, QueueStatus, ReplicationQueue};
use crate::quorum;
use crate::restart::SessionKeeper;
use crate::settings::TableSettings;
use crate::storage::LocalStore;
use crate::writer::{InsertResult, Writer};

/// Monitoring snapshot, coordinator-backed fields included.
#[derive(Clone, Debug, Default)]
pub struct TableStatus {
    pub replica_name: String,
    pub coordinator_path: String,
    pub is_leader: bool,
    pub can_become_leader: bool,
    pub is_readonly: bool,
    pub is_session_expired: bool,
    pub queue: QueueStatus,
    pub parts_to_check: usize,
    pub columns_version: i32,
    pub metadata_version: i32,
    pub log_max_index: u64,
    pub log_pointer: u64,
    pub total_replicas: usize,
    pub active_replicas: usize,
}

pub struct ReplicatedTable {
    paths: TablePaths,
    replica_name: String,
    settings: TableSettings,
    keeper: SessionKeeper,
    store: Arc<dyn LocalStore>,
    queue: Arc<ReplicationQueue>,
    leader: Arc<LeaderElection>,
    selector: MergeSelector,
    cleanup: CleanupTask,
    part_check: Arc<PartCheckTask>,
    alter_watcher: AlterWatcher,
    writer: Writer,
    structure: Arc<tokio::sync::RwLock<TableStructure>>,
    locks: Arc<ActionLocks>,
    exchange: Mutex<Option<ExchangeServer>>,
    exchange_addr: SocketAddr,
    is_readonly: AtomicBool,
    restart_started: AtomicBool,
    partial_shutdown: Mutex<CancellationToken>,
    full_shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicatedTable {
    /// Create (or attach to) a table in the coordinator and build the
    /// replica-local machinery. `startup` still has to run.
    pub async fn create(
        coordinator: Arc<dyn Coordinator>,
        store: Arc<dyn LocalStore>,
        root_path: &str,
        replica_name: &str,
        columns: Vec<String>,
        exchange_addr: SocketAddr,
        settings: TableSettings,
    ) -> Result<Arc<Self>> {
        let paths = TablePaths::new(root_path);
        let keeper = SessionKeeper::connect(coordinator).await?;
        let session = keeper.session();

        create_table_if_not_exists(session.as_ref(), &paths, &columns).await?;
        create_replica(session.as_ref(), &paths, replica_name).await?;

        let (columns_data, columns_stat) = session.get(&paths.columns()).await?;
        let (_, metadata_stat) = session.get(&paths.metadata()).await?;
        let structure = Arc::new(tokio::sync::RwLock::new(TableStructure {
            columns: alter::parse_columns(&columns_data),
            columns_version: columns_stat.version,
            metadata_version: metadata_stat.version,
        }));
        store.apply_columns(&alter::parse_columns(&columns_data))?;

        let queue = Arc::new(ReplicationQueue::new(
            paths.clone(),
            replica_name,
            BackoffPolicy {
                base: settings.queue_retry_backoff,
                max: settings.queue_retry_backoff_max,
            },
        ));
        let leader = Arc::new(LeaderElection::new(paths.clone(), replica_name));
        let selector = MergeSelector::new(paths.clone(), replica_name, settings.clone());
        let cleanup = CleanupTask::new(paths.clone(), settings.clone());
        let part_check = Arc::new(PartCheckTask::new(
            paths.clone(),
            replica_name,
            store.clone(),
            queue.clone(),
            settings.max_parallel_part_checks,
        ));
        let alter_watcher = AlterWatcher::new(
            paths.clone(),
            replica_name,
            structure.clone(),
            store.clone(),
        );
        let writer = Writer::new(
            paths.clone(),
            replica_name,
            settings.clone(),
            store.clone(),
            structure.clone(),
        );

        Ok(Arc::new(Self {
            paths,
            replica_name: replica_name.to_string(),
            settings,
            keeper,
            store,
            queue,
            leader,
            selector,
            cleanup,
            part_check,
            alter_watcher,
            writer,
            structure,
            locks: Arc::new(ActionLocks::default()),
            exchange: Mutex::new(None),
            exchange_addr,
            is_readonly: AtomicBool::new(true),
            restart_started: AtomicBool::new(false),
            partial_shutdown: Mutex::new(CancellationToken::new()),
            full_shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn replica_name(&self) -> &str {
        &self.replica_name
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn is_readonly(&self) -> bool {
        self.is_readonly.load(Ordering::SeqCst)
    }

    pub fn is_leader(&self) -> bool {
        self.leader.is_leader()
    }

    /// Pause one class of background actions until the guard drops.
    pub fn action_lock(&self, kind: ActionKind) -> ActionLockGuard {
        self.locks.stop(kind)
    }

    pub fn enqueue_part_for_check(&self, part_name: &str, delay: Duration) {
        self.part_check.enqueue_part(part_name, delay);
    }

    /// Activate the replica and start every background task.
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        let session = self.keeper.session();

        let server = ExchangeServer::start(
            self.exchange_addr,
            self.store.clone(),
            &self.settings,
            Some(self.locks.clone()),
        )
        .await?;
        let host = server.addr().to_string();
        *self.exchange.lock().unwrap() = Some(server);

        self.activate_replica(session.as_ref(), &host).await?;
        self.recover_if_lost(session.as_ref()).await?;
        self.check_parts(session.as_ref()).await?;
        self.queue
            .load(session.as_ref(), &self.local_parts())
            .await?;
        if self.settings.can_become_leader {
            self.leader.enter(session.as_ref()).await?;
        }
        self.is_readonly.store(false, Ordering::SeqCst);
        self.start_background_tasks();
        if !self.restart_started.swap(true, Ordering::SeqCst) {
            self.spawn_restart_task();
        }
        tracing::info!(
            replica = %self.replica_name,
            path = %self.paths.root(),
            %host,
            "replicated table started"
        );
        Ok(())
    }

    /// Full shutdown: stop every task including restart, release ephemerals.
    pub async fn shutdown(&self) {
        self.full_shutdown.cancel();
        self.partial_shutdown.lock().unwrap().cancel();
        self.is_readonly.store(true, Ordering::SeqCst);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        let server = self.exchange.lock().unwrap().take();
        if let Some(server) = server {
            server.stop().await;
        }

        let session = self.keeper.session();
        if !session.is_expired() {
            let _ = self.leader.exit(session.as_ref()).await;
            let _ = repltree_coord::delete_if_exists(
                session.as_ref(),
                &self.paths.is_active(&self.replica_name),
            )
            .await;
        }
        tracing::info!(replica = %self.replica_name, "replicated table shut down");
    }

    fn local_parts(&self) -> ActivePartSet {
        ActivePartSet::from_parts(self.store.enumerate_active_parts())
    }

    fn assert_not_readonly(&self) -> Result<()> {
        if self.is_readonly() {
            return Err(EngineError::ReplicaReadonly);
        }
        Ok(())
    }

    async fn activate_replica(&self, session: &dyn CoordSession, host: &str) -> Result<()> {
        match session
            .create(
                &self.paths.is_active(&self.replica_name),
                Vec::new(),
                CreateMode::Ephemeral,
            )
            .await
        {
            Ok(_) => {}
            Err(CoordError::NodeExists(path)) => {
                return Err(EngineError::LogicalInvariantViolated(format!(
                    "replica {} is already active ({path})",
                    self.replica_name
                )));
            }
            Err(err) => return Err(err.into()),
        }
        set_or_create(
            session,
            &self.paths.host(&self.replica_name),
            host.as_bytes().to_vec(),
        )
        .await?;
        Ok(())
    }

    /// Reconcile the local part set with this replica's coordinator
    /// registrations: missing parts are refetched, unregistered local parts
    /// are registered.
    async fn check_parts(&self, session: &dyn CoordSession) -> Result<()> {
        let registered = session
            .children(&self.paths.parts_dir(&self.replica_name))
            .await?;
        let local = self.local_parts();

        for name in &registered {
            let Ok(info) = PartInfo::parse(name) else {
                continue;
            };
            if local.covering(&info).is_none() {
                tracing::warn!(part = %name, "registered part missing locally, scheduling refetch");
                repltree_coord::delete_if_exists(
                    session,
                    &self.paths.part(&self.replica_name, name),
                )
                .await?;
                enqueue_fetch_direct(session, &self.paths, &self.replica_name, name).await?;
            }
        }
        for part in local.parts() {
            let name = part.name();
            if registered.contains(&name) {
                continue;
            }
            let checksums = self.store.checksum(&name)?;
            match session
                .create(
                    &self.paths.part(&self.replica_name, &name),
                    checksums.to_json(),
                    CreateMode::Persistent,
                )
                .await
            {
                Ok(_) => {
                    tracing::info!(part = %name, "registered local part found on startup");
                }
                Err(CoordError::NodeExists(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn start_background_tasks(self: &Arc<Self>) {
        let partial = CancellationToken::new();
        *self.partial_shutdown.lock().unwrap() = partial.clone();

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.spawn_queue_updating(partial.clone()));
        tasks.push(self.spawn_queue_executing(partial.clone()));
        tasks.push(self.spawn_merge_selecting(partial.clone()));
        tasks.push(self.spawn_mutations_updating(partial.clone()));
        tasks.push(self.spawn_cleanup(partial.clone()));
        tasks.push(self.spawn_part_check(partial.clone()));
        tasks.push(self.spawn_alter_watcher(partial));
    }

    fn spawn_queue_updating(self: &Arc<Self>, partial: CancellationToken) -> JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move {
            let log_dir = table.paths.log_dir();
            loop {
                let session = table.keeper.session();
                let watch = match session.children_watch(&log_dir).await {
                    Ok((_, watch)) => Some(watch),
                    Err(_) => None,
                };
                if let Err(err) = table.queue.pull_logs_to_queue(session.as_ref()).await {
                    if err.is_session_expired() {
                        // Parked until the restart task recovers.
                    } else {
                        tracing::warn!(error = %err, "queue update failed");
                    }
                }
                tokio::select! {
                    _ = partial.cancelled() => break,
                    _ = table.full_shutdown.cancelled() => break,
                    _ = wait_opt(watch) => {}
                    _ = tokio::time::sleep(table.settings.queue_update_sleep) => {}
                }
            }
        })
    }

    fn spawn_queue_executing(self: &Arc<Self>, partial: CancellationToken) -> JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move {
            let executor = QueueExecutor::new(
                table.paths.clone(),
                &table.replica_name,
                table.settings.clone(),
                table.store.clone(),
                table.queue.clone(),
                table.locks.clone(),
                partial.clone(),
            );
            loop {
                if partial.is_cancelled() || table.full_shutdown.is_cancelled() {
                    break;
                }
                let session = table.keeper.session();
                let pause = match executor.queue_task(session.as_ref()).await {
                    TaskResult::Success => Duration::ZERO,
                    TaskResult::Error => Duration::from_millis(50),
                    TaskResult::NothingToDo => table.settings.queue_update_sleep,
                };
                tokio::select! {
                    _ = partial.cancelled() => break,
                    _ = table.full_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        })
    }

    fn spawn_merge_selecting(self: &Arc<Self>, partial: CancellationToken) -> JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move {
            if !table.settings.can_become_leader {
                return;
            }
            loop {
                if partial.is_cancelled() || table.full_shutdown.is_cancelled() {
                    break;
                }
                let session = table.keeper.session();
                match table.leader.check(session.as_ref()).await {
                    Ok(LeaderState::Leader) => {
                        if let Err(err) = table.merge_selecting_pass(session.as_ref()).await {
                            if !err.is_session_expired() {
                                tracing::warn!(error = %err, "merge selection failed");
                            }
                        }
                        tokio::select! {
                            _ = partial.cancelled() => break,
                            _ = tokio::time::sleep(table.settings.merge_selecting_sleep) => {}
                        }
                    }
                    Ok(LeaderState::Follower(watch)) => {
                        tokio::select! {
                            _ = partial.cancelled() => break,
                            _ = table.full_shutdown.cancelled() => break,
                            _ = watch.wait() => {}
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                    Err(_) => {
                        tokio::select! {
                            _ = partial.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                        }
                    }
                }
            }
        })
    }

    async fn merge_selecting_pass(&self, session: &dyn CoordSession) -> Result<()> {
        if self.locks.is_blocked(ActionKind::Merges) {
            return Ok(());
        }
        let local = self.local_parts();
        let virtual_parts = self.queue.virtual_parts();
        let mutations = mutation::load_all(session, &self.paths).await?;
        let in_queue = self.queue.count_merges_and_mutations();
        let free_space = self.store.free_space();

        let store = &self.store;
        let decisions = self.selector.select(
            &local,
            &virtual_parts,
            &mutations,
            in_queue,
            free_space,
            |part| {
                store
                    .checksum(&part.name())
                    .map(|c| c.total_size())
                    .unwrap_or(0)
            },
        );
        for decision in &decisions {
            self.selector.propose(session, decision).await?;
        }
        Ok(())
    }

    fn spawn_mutations_updating(self: &Arc<Self>, partial: CancellationToken) -> JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move {
            loop {
                let session = table.keeper.session();
                match mutation::load_all(session.as_ref(), &table.paths).await {
                    Ok(mutations) => {
                        if let Some(max_seq) = mutations.keys().max() {
                            let _ = set_or_create(
                                session.as_ref(),
                                &table.paths.mutation_pointer(&table.replica_name),
                                max_seq.to_string().into_bytes(),
                            )
                            .await;
                        }
                    }
                    Err(err) if !err.is_session_expired() => {
                        tracing::debug!(error = %err, "mutations update failed");
                    }
                    Err(_) => {}
                }
                tokio::select! {
                    _ = partial.cancelled() => break,
                    _ = table.full_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(table.settings.queue_update_sleep.max(Duration::from_millis(200))) => {}
                }
            }
        })
    }

    fn spawn_cleanup(self: &Arc<Self>, partial: CancellationToken) -> JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = partial.cancelled() => break,
                    _ = table.full_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(table.settings.cleanup_delay_period) => {}
                }
                let session = table.keeper.session();
                if let Err(err) = table.cleanup.run_once(session.as_ref()).await {
                    if !err.is_session_expired() {
                        tracing::warn!(error = %err, "cleanup pass failed");
                    }
                }
                let store = table.store.clone();
                let holds = move |part: &str| store.checksum(part).is_ok();
                if let Err(err) = quorum::resolve_orphaned(
                    session.as_ref(),
                    &table.paths,
                    &table.replica_name,
                    holds,
                )
                .await
                {
                    if !err.is_session_expired() {
                        tracing::debug!(error = %err, "orphaned quorum resolution failed");
                    }
                }
            }
        })
    }

    fn spawn_part_check(self: &Arc<Self>, partial: CancellationToken) -> JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = partial.cancelled() => break,
                    _ = table.full_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
                let session = table.keeper.session();
                if let Err(err) = table.part_check.run_pending(session.as_ref()).await {
                    if !err.is_session_expired() {
                        tracing::warn!(error = %err, "part check pass failed");
                    }
                }
            }
        })
    }

    fn spawn_alter_watcher(self: &Arc<Self>, partial: CancellationToken) -> JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move {
            loop {
                let session = table.keeper.session();
                if let Err(err) = table.alter_watcher.run_once(session.as_ref()).await {
                    if !err.is_session_expired() {
                        tracing::warn!(error = %err, "alter application failed");
                    }
                }
                let watches = table.alter_watcher.watches(session.as_ref()).await.ok();
                let (columns_watch, metadata_watch) = match watches {
                    Some((c, m)) => (Some(c), Some(m)),
                    None => (None, None),
                };
                tokio::select! {
                    _ = partial.cancelled() => break,
                    _ = table.full_shutdown.cancelled() => break,
                    _ = wait_opt(columns_watch) => {}
                    _ = wait_opt(metadata_watch) => {}
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
        })
    }

    fn spawn_restart_task(self: &Arc<Self>) {
        let table = self.clone();
        let task = tokio::spawn(async move {
            let probe = table
                .settings
                .zookeeper_session_timeout
                .checked_div(4)
                .unwrap_or(Duration::from_millis(250))
                .max(Duration::from_millis(50));
            loop {
                tokio::select! {
                    _ = table.full_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(probe) => {}
                }
                if !table.keeper.is_expired() {
                    continue;
                }
                tracing::warn!(
                    replica = %table.replica_name,
                    "coordinator session expired; entering readonly"
                );
                table.enter_partial_shutdown();

                loop {
                    if table.full_shutdown.is_cancelled() {
                        return;
                    }
                    match table.recover().await {
                        Ok(()) => break,
                        Err(err) => {
                            tracing::warn!(error = %err, "session recovery failed, retrying");
                            tokio::select! {
                                _ = table.full_shutdown.cancelled() => return,
                                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                            }
                        }
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    /// If cleanup marked this replica lost while it was away, clone back:
    /// reset the log pointer to the tail and fetch every part an active
    /// replica holds.
    async fn recover_if_lost(&self, session: &dyn CoordSession) -> Result<()> {
        let flag_path = self.paths.is_lost(&self.replica_name);
        let lost = match session.get(&flag_path).await {
            Ok((data, _)) => data == b"1",
            Err(CoordError::NoNode(_)) => false,
            Err(err) => return Err(err.into()),
        };
        if !lost {
            return Ok(());
        }
        tracing::warn!(
            replica = %self.replica_name,
            "replica was marked lost; cloning from an active replica"
        );
        let log_names = session.children(&self.paths.log_dir()).await?;
        let pointer = log_names
            .iter()
            .filter_map(|n| repltree_coord::paths::sequential_index(n))
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);
        session
            .set(
                &self.paths.log_pointer(&self.replica_name),
                pointer.to_string().into_bytes(),
                None,
            )
            .await?;
        let fetches =
            catch_up_from_active_replica(session, &self.paths, &self.replica_name).await?;
        session.set(&flag_path, b"0".to_vec(), None).await?;
        tracing::info!(
            replica = %self.replica_name,
            log_pointer = pointer,
            initial_fetches = fetches,
            "lost replica cloned"
        );
        Ok(())
    }

    fn enter_partial_shutdown(&self) {
        self.is_readonly.store(true, Ordering::SeqCst);
        self.partial_shutdown.lock().unwrap().cancel();
        self.leader.on_session_expired();
    }

    /// Rebuild state on a fresh session and restart the parked tasks.
    async fn recover(self: &Arc<Self>) -> Result<()> {
        let session = self.keeper.renew().await?;
        let host = self
            .exchange
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.addr().to_string())
            .unwrap_or_default();
        self.activate_replica(session.as_ref(), &host).await?;
        self.recover_if_lost(session.as_ref()).await?;
        self.check_parts(session.as_ref()).await?;
        self.queue
            .load(session.as_ref(), &self.local_parts())
            .await?;
        let store = self.store.clone();
        let holds = move |part: &str| store.checksum(part).is_ok();
        quorum::resolve_orphaned(session.as_ref(), &self.paths, &self.replica_name, holds)
            .await?;
        if self.settings.can_become_leader {
            self.leader.enter(session.as_ref()).await?;
        }
        self.is_readonly.store(false, Ordering::SeqCst);
        self.start_background_tasks();
        tracing::info!(replica = %self.replica_name, "replica recovered after session expiry");
        Ok(())
    }

    /// INSERT one block of rows.
    pub async fn insert(
        &self,
        partition_id: &str,
        rows: &[String],
        block_id: Option<&str>,
        quorum: usize,
    ) -> Result<InsertResult> {
        self.assert_not_readonly()?;
        let session = self.keeper.session();
        self.writer
            .write(session.as_ref(), partition_id, rows, block_id, quorum)
            .await
    }

    /// DROP PARTITION: fence the partition, wait out in-flight inserts,
    /// clear its dedup keys and append the DROP_RANGE entry.
    pub async fn drop_partition(&self, partition_id: &str, detach: bool) -> Result<(u64, String)> {
        self.assert_not_readonly()?;
        let session = self.keeper.session();

        let fence = match allocate_block_number(session.as_ref(), &self.paths, partition_id, None)
            .await?
        {
            AllocatedBlock::Lock(lock) => {
                let fence = lock.number;
                lock.abort(session.as_ref()).await;
                fence
            }
            AllocatedBlock::Deduplicated { .. } => {
                return Err(EngineError::LogicalInvariantViolated(
                    "dedup hit without block_id".into(),
                ))
            }
        };
        if fence == 0 {
            // No block was ever allocated here: nothing to drop.
            tracing::debug!(partition = partition_id, "drop of empty partition is a no-op");
            return Ok((self.queue.log_pointer(), String::new()));
        }

        // In-flight inserts below the fence either commit (their GET lands
        // before our DROP in the log) or abort; wait for their ephemerals.
        self.wait_for_inserts_below(session.as_ref(), partition_id, fence)
            .await?;

        let block_ids = self
            .partition_block_ids(session.as_ref(), partition_id)
            .await?;
        self.cleanup
            .clear_blocks_in_partition(session.as_ref(), partition_id, &block_ids)
            .await?;

        let range = PartInfo::covering_range(partition_id, fence - 1);
        let entry = LogEntry::drop_range(&self.replica_name, range.name(), detach);
        let created = session
            .create(
                &self.paths.log_entry_prefix(),
                entry.to_bytes(),
                CreateMode::PersistentSequential,
            )
            .await?;
        let index = repltree_coord::paths::sequential_index(
            created.rsplit('/').next().unwrap_or(&created),
        )
        .unwrap_or(0);
        tracing::info!(
            partition = partition_id,
            range = %range.name(),
            log_index = index,
            detach,
            "drop partition logged"
        );
        Ok((index, range.name()))
    }

    async fn wait_for_inserts_below(
        &self,
        session: &dyn CoordSession,
        partition_id: &str,
        fence: i64,
    ) -> Result<()> {
        let dir = self.paths.partition_block_numbers(partition_id);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let mut in_flight = 0;
            let children = match session.children(&dir).await {
                Ok(children) => children,
                Err(CoordError::NoNode(_)) => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            for name in children {
                let Some(number) = repltree_coord::paths::sequential_index(&name) else {
                    continue;
                };
                if number as i64 >= fence {
                    continue;
                }
                match session.exists(&format!("{dir}/{name}")).await? {
                    Some(stat) if stat.ephemeral_owner != 0 => in_flight += 1,
                    _ => {}
                }
            }
            if in_flight == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Aborted(format!(
                    "{in_flight} inserts still in flight in partition {partition_id}"
                )));
            }
            tokio::select! {
                _ = self.full_shutdown.cancelled() => {
                    return Err(EngineError::Aborted("shutdown during drop".into()));
                }
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
    }

    /// Dedup keys whose recorded part belongs to `partition_id`.
    async fn partition_block_ids(
        &self,
        session: &dyn CoordSession,
        partition_id: &str,
    ) -> Result<Vec<String>> {
        let dir = self.paths.blocks_dir();
        let mut out = Vec::new();
        let names = match session.children(&dir).await {
            Ok(names) => names,
            Err(CoordError::NoNode(_)) => return Ok(out),
            Err(err) => return Err(err.into()),
        };
        for name in names {
            let (data, _) = match session.get(&format!("{dir}/{name}")).await {
                Ok(found) => found,
                Err(CoordError::NoNode(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            if let Ok(info) = PartInfo::parse(&String::from_utf8_lossy(&data)) {
                if info.partition_id == partition_id {
                    out.push(name);
                }
            }
        }
        Ok(out)
    }

    /// ALTER: publish a new column set. Returns the data to wait on.
    pub async fn alter_columns(&self, columns: &[String]) -> Result<Vec<u8>> {
        self.assert_not_readonly()?;
        let session = self.keeper.session();
        let data = alter::format_columns(columns);
        session.set(&self.paths.columns(), data.clone(), None).await?;
        tracing::info!(?columns, "column change published");
        Ok(data)
    }

    /// Wait until every live replica has applied the published column set.
    /// Names the first lagging replica on timeout.
    pub async fn wait_for_alter(&self, columns_data: &[u8], timeout: Duration) -> Result<()> {
        let session = self.keeper.session();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match alter::first_lagging_replica(session.as_ref(), &self.paths, columns_data).await?
            {
                None => return Ok(()),
                Some(replica) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(EngineError::Aborted(format!(
                            "alter not applied on replica {replica}"
                        )));
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    }

    /// ALTER DELETE / ALTER UPDATE: record a mutation fenced at the current
    /// block numbers of every partition.
    pub async fn mutate(&self, commands: Vec<MutationCommand>) -> Result<u64> {
        self.assert_not_readonly()?;
        let session = self.keeper.session();

        let mut fences = std::collections::BTreeMap::new();
        let partitions = match session.children(&self.paths.block_numbers_dir()).await {
            Ok(partitions) => partitions,
            Err(CoordError::NoNode(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        for partition in partitions {
            match allocate_block_number(session.as_ref(), &self.paths, &partition, None).await? {
                AllocatedBlock::Lock(lock) => {
                    let fence = lock.number;
                    lock.abort(session.as_ref()).await;
                    fences.insert(partition, fence);
                }
                AllocatedBlock::Deduplicated { .. } => unreachable!("no block_id given"),
            }
        }

        let entry = MutationEntry::new(&self.replica_name, fences, commands);
        let created = session
            .create(
                &self.paths.mutation_prefix(),
                entry.to_bytes(),
                CreateMode::PersistentSequential,
            )
            .await?;
        let seq = repltree_coord::paths::sequential_index(
            created.rsplit('/').next().unwrap_or(&created),
        )
        .unwrap_or(0);
        tracing::info!(mutation = seq, "mutation recorded");
        Ok(seq)
    }

    /// Wait until every live replica's log pointer passed `log_index` and no
    /// queue entry still targets `target_part`.
    pub async fn wait_for_all_replicas_to_process_log_entry(
        &self,
        log_index: u64,
        target_part: &str,
        timeout: Duration,
    ) -> Result<()> {
        let session = self.keeper.session();
        let deadline = tokio::time::Instant::now() + timeout;
        let replicas = session.children(&self.paths.replicas_dir()).await?;
        for replica in replicas {
            if session
                .exists(&self.paths.is_active(&replica))
                .await?
                .is_none()
            {
                continue;
            }
            self.wait_for_replica_to_process_log_entry(
                session.as_ref(),
                &replica,
                log_index,
                target_part,
                deadline,
            )
            .await?;
        }
        Ok(())
    }

    pub async fn wait_for_replica_to_process_log_entry(
        &self,
        session: &dyn CoordSession,
        replica: &str,
        log_index: u64,
        target_part: &str,
        deadline: tokio::time::Instant,
    ) -> Result<()> {
        loop {
            let (pointer_data, _) = session.get(&self.paths.log_pointer(replica)).await?;
            let pointer: u64 = String::from_utf8_lossy(&pointer_data)
                .trim()
                .parse()
                .unwrap_or(0);
            if pointer > log_index {
                let mut pending = false;
                for name in session.children(&self.paths.queue_dir(replica)).await? {
                    let path = format!("{}/{}", self.paths.queue_dir(replica), name);
                    let (data, _) = match session.get(&path).await {
                        Ok(found) => found,
                        Err(CoordError::NoNode(_)) => continue,
                        Err(err) => return Err(err.into()),
                    };
                    if let Ok(entry) = LogEntry::from_bytes(&data) {
                        if entry.new_part_name == target_part {
                            pending = true;
                            break;
                        }
                    }
                }
                if !pending {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Aborted(format!(
                    "replica {replica} has not processed log entry {log_index}"
                )));
            }
            tokio::select! {
                _ = self.full_shutdown.cancelled() => {
                    return Err(EngineError::Aborted("shutdown during wait".into()));
                }
                _ = tokio::time::sleep(Duration::from_millis(30)) => {}
            }
        }
    }

    /// The per-partition block ceiling for sequentially-consistent reads.
    pub async fn max_added_blocks(&self) -> Result<std::collections::BTreeMap<String, i64>> {
        let session = self.keeper.session();
        quorum::max_added_blocks(session.as_ref(), &self.paths).await
    }

    /// Active parts visible to a sequentially-consistent reader.
    pub async fn sequential_parts(&self) -> Result<Vec<PartInfo>> {
        let ceilings = self.max_added_blocks().await?;
        Ok(self
            .local_parts()
            .parts()
            .filter(|part| match ceilings.get(&part.partition_id) {
                Some(ceiling) => part.max_block <= *ceiling,
                None => true,
            })
            .cloned()
            .collect())
    }

    pub async fn status(&self) -> TableStatus {
        let session = self.keeper.session();
        let structure = self.structure.read().await;
        let mut status = TableStatus {
            replica_name: self.replica_name.clone(),
            coordinator_path: self.paths.root().to_string(),
            is_leader: self.leader.is_leader(),
            can_become_leader: self.settings.can_become_leader,
            is_readonly: self.is_readonly(),
            is_session_expired: session.is_expired(),
            queue: self.queue.status(),
            parts_to_check: self.part_check.parts_to_check(),
            columns_version: structure.columns_version,
            metadata_version: structure.metadata_version,
            log_max_index: 0,
            log_pointer: self.queue.log_pointer(),
            total_replicas: 0,
            active_replicas: 0,
        };
        drop(structure);

        if let Ok(names) = session.children(&self.paths.log_dir()).await {
            status.log_max_index = names
                .iter()
                .filter_map(|n| repltree_coord::paths::sequential_index(n))
                .max()
                .unwrap_or(0);
        }
        if let Ok(replicas) = session.children(&self.paths.replicas_dir()).await {
            status.total_replicas = replicas.len();
            for replica in replicas {
                if let Ok(Some(_)) = session.exists(&self.paths.is_active(&replica)).await {
                    status.active_replicas += 1;
                }
            }
        }
        status
    }

    /// Postpone reasons for monitoring.
    pub fn queue_postpone_reasons(&self) -> std::collections::BTreeMap<String, String> {
        self.queue.postpone_reasons()
    }
}

async fn wait_opt(watch: Option<WatchFuture>) {
    match watch {
        Some(watch) => {
            watch.wait().await;
        }
        None => std::future::pending().await,
    }
}

async fn set_or_create(session: &dyn CoordSession, path: &str, data: Vec<u8>) -> Result<()> {
    match session.set(path, data.clone(), None).await {
        Ok(_) => Ok(()),
        Err(CoordError::NoNode(_)) => {
            match session.create(path, data, CreateMode::Persistent).await {
                Ok(_) | Err(CoordError::NodeExists(_)) => Ok(()),
                Err(err) => Err(err.into()),
            }
        }
        Err(err) => Err(err.into()),
    }
}

async fn create_table_if_not_exists(
    session: &dyn CoordSession,
    paths: &TablePaths,
    columns: &[String],
) -> Result<()> {
    ensure_path(session, paths.root()).await?;
    for dir in [
        paths.log_dir(),
        paths.blocks_dir(),
        paths.block_numbers_dir(),
        paths.quorum_dir(),
        paths.quorum_last_part_dir(),
        paths.mutations_dir(),
        paths.leader_election_dir(),
        paths.replicas_dir(),
    ] {
        ensure_path(session, &dir).await?;
    }
    for (path, data) in [
        (paths.metadata(), b"format version: 1\n".to_vec()),
        (paths.columns(), alter::format_columns(columns)),
    ] {
        match session.create(&path, data, CreateMode::Persistent).await {
            Ok(_) | Err(CoordError::NodeExists(_)) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

async fn create_replica(
    session: &dyn CoordSession,
    paths: &TablePaths,
    replica_name: &str,
) -> Result<()> {
    if session.exists(&paths.replica(replica_name)).await?.is_some() {
        return Ok(());
    }

    for dir in [
        paths.replica(replica_name),
        paths.queue_dir(replica_name),
        paths.parts_dir(replica_name),
        paths.flags_dir(replica_name),
    ] {
        ensure_path(session, &dir).await?;
    }

    // A new replica starts at the log tail and catches up on existing data
    // by fetching every part some active replica holds.
    let log_names = session.children(&paths.log_dir()).await?;
    let pointer = log_names
        .iter()
        .filter_map(|n| repltree_coord::paths::sequential_index(n))
        .max()
        .map(|max| max + 1)
        .unwrap_or(0);

    for (path, data) in [
        (paths.log_pointer(replica_name), pointer.to_string().into_bytes()),
        (paths.is_lost(replica_name), b"0".to_vec()),
        (paths.mutation_pointer(replica_name), b"0".to_vec()),
    ] {
        match session.create(&path, data, CreateMode::Persistent).await {
            Ok(_) | Err(CoordError::NodeExists(_)) => {}
            Err(err) => return Err(err.into()),
        }
    }

    let fetches = catch_up_from_active_replica(session, paths, replica_name).await?;
    tracing::info!(
        replica = replica_name,
        log_pointer = pointer,
        initial_fetches = fetches,
        "replica created"
    );
    Ok(())
}

/// Enqueue GETs for every part some active replica holds. Parts already
/// present locally complete as no-ops when the queue sees them.
async fn catch_up_from_active_replica(
    session: &dyn CoordSession,
    paths: &TablePaths,
    replica_name: &str,
) -> Result<usize> {
    let mut source_parts: Vec<String> = Vec::new();
    for replica in session.children(&paths.replicas_dir()).await? {
        if replica == replica_name {
            continue;
        }
        if session.exists(&paths.is_active(&replica)).await?.is_none() {
            continue;
        }
        source_parts = session.children(&paths.parts_dir(&replica)).await?;
        if !source_parts.is_empty() {
            break;
        }
    }
    let caught_up = ActivePartSet::from_parts(
        source_parts.iter().filter_map(|n| PartInfo::parse(n).ok()),
    );
    for part in caught_up.parts() {
        enqueue_fetch_direct(session, paths, replica_name, &part.name()).await?;
    }
    Ok(caught_up.len())
}

/// Write a self-generated GET into a replica's queue without a loaded
/// `ReplicationQueue` (startup and replica creation paths).
async fn enqueue_fetch_direct(
    session: &dyn CoordSession,
    paths: &TablePaths,
    replica_name: &str,
    part_name: &str,
) -> Result<()> {
    let entry = LogEntry::get("", part_name.to_string(), None, 0);
    session
        .create(
            &paths.queue_entry_prefix(replica_name),
            entry.to_bytes(),
            CreateMode::PersistentSequential,
        )
        .await?;
    Ok(())
}
