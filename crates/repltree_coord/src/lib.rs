//! Coordination-service contract for the replicated table engine.
//!
//! The engine talks to a strongly-consistent hierarchical key/value service
//! with sessions, ephemeral nodes, sequential children, one-shot watches and
//! atomic multi-updates. This crate defines that contract (`Coordinator` /
//! `CoordSession`) plus the fixed path schema, and ships `MemoryCoordinator`,
//! a single-process implementation with failure injection that every
//! integration test runs against.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
pub mod paths;

pub use memory::MemoryCoordinator;
pub use paths::TablePaths;

/// Session identifier. Ephemeral nodes record the owning session.
pub type SessionId = u64;

/// Node creation mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    /// Persistent node whose name gets a zero-padded monotonic suffix
    /// assigned by the parent.
    PersistentSequential,
    /// Ephemeral node with a sequential suffix.
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Node metadata returned alongside reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    /// Data version, bumped on every set.
    pub version: i32,
    /// Child-list version, bumped on every child create/delete.
    pub cversion: i32,
    /// Owning session for ephemeral nodes, 0 otherwise.
    pub ephemeral_owner: SessionId,
    pub num_children: usize,
    /// Node creation time, unix milliseconds.
    pub ctime_ms: u64,
}

/// One element of an atomic multi-update.
#[derive(Clone, Debug)]
pub enum Op {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    Delete {
        path: String,
        /// `None` matches any version.
        version: Option<i32>,
    },
    Set {
        path: String,
        data: Vec<u8>,
        version: Option<i32>,
    },
    /// Version guard with no side effect.
    Check { path: String, version: i32 },
}

impl Op {
    pub fn path(&self) -> &str {
        match self {
            Op::Create { path, .. }
            | Op::Delete { path, .. }
            | Op::Set { path, .. }
            | Op::Check { path, .. } => path,
        }
    }
}

/// Per-op result of a successful multi.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpResult {
    /// Final path, with the sequential suffix resolved.
    Created { path: String },
    Deleted,
    Set { version: i32 },
    Checked,
}

/// Event delivered through a one-shot watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    DataChanged,
    ChildrenChanged,
    Created,
    Deleted,
    /// The watching session expired; the watch will never fire for real.
    SessionExpired,
}

/// One-shot watch handle. Resolves at most once.
#[derive(Debug)]
pub struct WatchFuture {
    rx: tokio::sync::oneshot::Receiver<WatchEvent>,
}

impl WatchFuture {
    pub fn new(rx: tokio::sync::oneshot::Receiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the event. A dropped coordinator side reports expiry.
    pub async fn wait(self) -> WatchEvent {
        self.rx.await.unwrap_or(WatchEvent::SessionExpired)
    }
}

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("no node at {0}")]
    NoNode(String),
    #[error("node already exists at {0}")]
    NodeExists(String),
    #[error("version mismatch at {path}: expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },
    #[error("node {0} has children")]
    NotEmpty(String),
    #[error("no parent for {0}")]
    NoParent(String),
    #[error("connection to coordinator lost")]
    ConnectionLoss,
    #[error("coordinator session expired")]
    SessionExpired,
    #[error("multi-update failed at op {index}: {source}")]
    MultiFailed {
        index: usize,
        #[source]
        source: Box<CoordError>,
    },
}

impl CoordError {
    /// Errors worth retrying on the same session.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordError::ConnectionLoss)
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, CoordError::SessionExpired)
    }

    /// Unwrap a multi failure to the op-level error.
    pub fn unwrap_multi(&self) -> &CoordError {
        match self {
            CoordError::MultiFailed { source, .. } => source,
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;

/// One coordinator session. All ops fail with `SessionExpired` once the
/// session is gone; the caller is expected to obtain a fresh session through
/// `Coordinator::connect`.
#[async_trait]
pub trait CoordSession: Send + Sync {
    fn id(&self) -> SessionId;
    fn is_expired(&self) -> bool;

    /// Returns the created path (sequential suffix resolved).
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String>;
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)>;
    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, Stat, WatchFuture)>;
    async fn set(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat>;
    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()>;
    async fn children(&self, path: &str) -> Result<Vec<String>>;
    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, WatchFuture)>;
    async fn exists(&self, path: &str) -> Result<Option<Stat>>;
    async fn exists_watch(&self, path: &str) -> Result<(Option<Stat>, WatchFuture)>;
    /// Atomic multi-update: either every op applies or none does.
    async fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResult>>;
}

/// The coordination service itself; hands out sessions.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn CoordSession>>;
}

/// Create `path` and any missing ancestors as persistent nodes with empty
/// data. Existing nodes are left untouched.
pub async fn ensure_path(session: &dyn CoordSession, path: &str) -> Result<()> {
    let mut prefix = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        prefix.push('/');
        prefix.push_str(segment);
        match session
            .create(&prefix, Vec::new(), CreateMode::Persistent)
            .await
        {
            Ok(_) | Err(CoordError::NodeExists(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Delete best-effort, swallowing `NoNode`.
pub async fn delete_if_exists(session: &dyn CoordSession, path: &str) -> Result<()> {
    match session.delete(path, None).await {
        Ok(()) | Err(CoordError::NoNode(_)) => Ok(()),
        Err(err) => Err(err),
    }
}
