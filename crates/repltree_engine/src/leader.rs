//! Leader election: smallest sequential ephemeral wins.
//!
//! Every electable replica parks one ephemeral sequential node under
//! `/leader_election/`. The holder of the smallest name is the leader and
//! the only replica allowed to write MERGE/MUTATE entries; everyone else
//! watches their immediate predecessor and re-checks when it disappears.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use repltree_coord::{paths, CoordError, CoordSession, CreateMode, TablePaths, WatchFuture};

use crate::error::{EngineError, Result};

/// What a non-leader waits on.
#[derive(Debug)]
pub enum LeaderState {
    Leader,
    /// Watch resolving when the predecessor's node goes away.
    Follower(WatchFuture),
}

pub struct LeaderElection {
    paths: TablePaths,
    replica_name: String,
    node_path: Mutex<Option<String>>,
    is_leader: AtomicBool,
}

impl LeaderElection {
    pub fn new(paths: TablePaths, replica_name: &str) -> Self {
        Self {
            paths,
            replica_name: replica_name.to_string(),
            node_path: Mutex::new(None),
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Join the election. Idempotent while our node is still present.
    pub async fn enter(&self, session: &dyn CoordSession) -> Result<()> {
        let existing = self.node_path.lock().unwrap().clone();
        if let Some(existing) = existing {
            if session.exists(&existing).await?.is_some() {
                return Ok(());
            }
        }
        let created = session
            .create(
                &self.paths.leader_election_prefix(),
                self.replica_name.clone().into_bytes(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        tracing::info!(replica = %self.replica_name, node = %created, "entered leader election");
        *self.node_path.lock().unwrap() = Some(created);
        self.is_leader.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Leave the election and stop being leader.
    pub async fn exit(&self, session: &dyn CoordSession) -> Result<()> {
        self.is_leader.store(false, Ordering::SeqCst);
        let node_path = self.node_path.lock().unwrap().take();
        if let Some(path) = node_path {
            repltree_coord::delete_if_exists(session, &path).await?;
        }
        Ok(())
    }

    /// Session gone: our ephemeral is gone with it.
    pub fn on_session_expired(&self) {
        self.is_leader.store(false, Ordering::SeqCst);
        self.node_path.lock().unwrap().take();
    }

    /// Decide leadership. Followers get a watch on their predecessor.
    pub async fn check(&self, session: &dyn CoordSession) -> Result<LeaderState> {
        let our_path = self
            .node_path
            .lock()
            .unwrap()
            .clone()
            .ok_or(EngineError::CoordinatorSessionExpired)?;
        let our_name = our_path.rsplit('/').next().unwrap_or("").to_string();
        let our_index = paths::sequential_index(&our_name)
            .ok_or_else(|| EngineError::LogicalInvariantViolated("bad election node".into()))?;

        let mut names = session
            .children(&self.paths.leader_election_dir())
            .await?;
        names.sort();

        if !names.contains(&our_name) {
            // Our node vanished: the session that owned it is gone.
            self.on_session_expired();
            return Err(EngineError::CoordinatorSessionExpired);
        }

        let predecessor = names
            .iter()
            .filter_map(|name| paths::sequential_index(name).map(|idx| (idx, name)))
            .filter(|(idx, _)| *idx < our_index)
            .max_by_key(|(idx, _)| *idx)
            .map(|(_, name)| name.clone());

        match predecessor {
            None => {
                if !self.is_leader.swap(true, Ordering::SeqCst) {
                    tracing::info!(replica = %self.replica_name, "became leader");
                }
                Ok(LeaderState::Leader)
            }
            Some(name) => {
                self.is_leader.store(false, Ordering::SeqCst);
                let path = format!("{}/{}", self.paths.leader_election_dir(), name);
                match session.exists_watch(&path).await {
                    Ok((Some(_), watch)) => Ok(LeaderState::Follower(watch)),
                    // The predecessor vanished between listing and watching;
                    // re-check immediately via an already-resolved wait.
                    Ok((None, watch)) => Ok(LeaderState::Follower(watch)),
                    Err(CoordError::NoNode(_)) => self.check_retry(),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    fn check_retry(&self) -> Result<LeaderState> {
        // Caller loops; an immediately-resolved watch keeps the shape.
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _ = tx.send(repltree_coord::WatchEvent::Deleted);
        Ok(LeaderState::Follower(WatchFuture::new(rx)))
    }
}
