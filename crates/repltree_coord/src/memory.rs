//! Single-process coordinator used by tests and local tooling.
//!
//! Implements the full session contract: ephemeral nodes reaped on expiry,
//! per-parent sequential suffixes, one-shot watches, atomic multi-updates,
//! plus failure injection (`expire_session`, `set_unavailable`).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::{
    CoordError, CoordSession, Coordinator, CreateMode, Op, OpResult, Result, SessionId, Stat,
    WatchEvent, WatchFuture,
};

#[derive(Clone)]
struct NodeRec {
    data: Vec<u8>,
    version: i32,
    cversion: i32,
    ephemeral_owner: SessionId,
    /// Counter feeding sequential child names. Never decreases, so
    /// sequential numbers stay strictly increasing across deletes.
    next_seq: u64,
    ctime_ms: u64,
}

impl NodeRec {
    fn new(data: Vec<u8>, ephemeral_owner: SessionId) -> Self {
        let ctime_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            data,
            version: 0,
            cversion: 0,
            ephemeral_owner,
            next_seq: 0,
            ctime_ms,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    Data,
    Children,
    Exists,
}

struct WatcherRec {
    session: SessionId,
    kind: WatchKind,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Default)]
struct Shared {
    nodes: BTreeMap<String, NodeRec>,
    watches: HashMap<String, Vec<WatcherRec>>,
    expired: HashMap<SessionId, bool>,
    next_session: SessionId,
    unavailable: bool,
}

/// In-process coordinator. Cloning shares the underlying tree.
#[derive(Clone, Default)]
pub struct MemoryCoordinator {
    shared: Arc<Mutex<Shared>>,
}

struct MemorySession {
    id: SessionId,
    shared: Arc<Mutex<Shared>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire one session: its ephemerals disappear, its watches fire with
    /// `SessionExpired`, and every later call on it fails.
    pub fn expire_session(&self, id: SessionId) {
        let mut shared = self.shared.lock().unwrap();
        if shared.expired.insert(id, true) == Some(true) {
            return;
        }

        let doomed: Vec<String> = shared
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == id)
            .map(|(path, _)| path.clone())
            .collect();
        tracing::debug!(session = id, ephemerals = doomed.len(), "session expired");
        let mut events = Vec::new();
        for path in doomed {
            shared.nodes.remove(&path);
            if let Some(parent) = parent_path(&path) {
                if let Some(node) = shared.nodes.get_mut(&parent) {
                    node.cversion += 1;
                }
                events.push((parent, WatchEvent::ChildrenChanged, true));
            }
            events.push((path, WatchEvent::Deleted, false));
        }
        for (path, event, children_scope) in events {
            fire(&mut shared, &path, event, children_scope);
        }

        // Watches registered by the expired session fire with the session
        // event instead of staying armed forever.
        for watchers in shared.watches.values_mut() {
            let mut kept = Vec::new();
            for watcher in watchers.drain(..) {
                if watcher.session == id {
                    let _ = watcher.tx.send(WatchEvent::SessionExpired);
                } else {
                    kept.push(watcher);
                }
            }
            *watchers = kept;
        }
    }

    /// Expire every session created so far.
    pub fn expire_all(&self) {
        let ids: Vec<SessionId> = {
            let shared = self.shared.lock().unwrap();
            shared
                .expired
                .iter()
                .filter(|(_, expired)| !**expired)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.expire_session(id);
        }
    }

    /// While set, every op fails with `ConnectionLoss`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.lock().unwrap().unavailable = unavailable;
    }

    /// Test hook: raw node data without session checks.
    pub fn peek(&self, path: &str) -> Option<Vec<u8>> {
        self.shared
            .lock()
            .unwrap()
            .nodes
            .get(path)
            .map(|n| n.data.clone())
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn connect(&self) -> Result<Arc<dyn CoordSession>> {
        let mut shared = self.shared.lock().unwrap();
        if shared.unavailable {
            return Err(CoordError::ConnectionLoss);
        }
        shared.next_session += 1;
        let id = shared.next_session;
        shared.expired.insert(id, false);
        Ok(Arc::new(MemorySession {
            id,
            shared: self.shared.clone(),
        }))
    }
}

fn parent_path(path: &str) -> Option<String> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        // Children of the root have no stored parent node.
        return None;
    }
    Some(path[..idx].to_string())
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") || path.len() < 2 {
        return Err(CoordError::NoNode(path.to_string()));
    }
    Ok(())
}

fn child_names(nodes: &BTreeMap<String, NodeRec>, dir: &str) -> Vec<String> {
    let prefix = format!("{dir}/");
    let mut out = Vec::new();
    for path in nodes.range(prefix.clone()..).map(|(p, _)| p) {
        if !path.starts_with(&prefix) {
            break;
        }
        let rest = &path[prefix.len()..];
        if !rest.contains('/') {
            out.push(rest.to_string());
        }
    }
    out
}

fn stat_of(nodes: &BTreeMap<String, NodeRec>, path: &str, node: &NodeRec) -> Stat {
    Stat {
        version: node.version,
        cversion: node.cversion,
        ephemeral_owner: node.ephemeral_owner,
        num_children: child_names(nodes, path).len(),
        ctime_ms: node.ctime_ms,
    }
}

/// Apply one op against `nodes`, recording watch events to fire on commit.
/// Events are `(path, event, is_children_scope)`.
fn apply_op(
    nodes: &mut BTreeMap<String, NodeRec>,
    op: &Op,
    session: SessionId,
    events: &mut Vec<(String, WatchEvent, bool)>,
) -> Result<OpResult> {
    match op {
        Op::Create { path, data, mode } => {
            validate_path(path)?;
            let final_path = if mode.is_sequential() {
                let parent = parent_path(path).ok_or_else(|| CoordError::NoParent(path.clone()))?;
                let parent_node = nodes
                    .get_mut(&parent)
                    .ok_or_else(|| CoordError::NoNode(parent.clone()))?;
                let seq = parent_node.next_seq;
                parent_node.next_seq += 1;
                format!("{path}{seq:010}")
            } else {
                path.clone()
            };
            if nodes.contains_key(&final_path) {
                return Err(CoordError::NodeExists(final_path));
            }
            if let Some(parent) = parent_path(&final_path) {
                let parent_node = nodes
                    .get_mut(&parent)
                    .ok_or_else(|| CoordError::NoNode(parent.clone()))?;
                if parent_node.ephemeral_owner != 0 {
                    return Err(CoordError::NoParent(parent));
                }
                parent_node.cversion += 1;
                events.push((parent, WatchEvent::ChildrenChanged, true));
            }
            let owner = if mode.is_ephemeral() { session } else { 0 };
            nodes.insert(final_path.clone(), NodeRec::new(data.clone(), owner));
            events.push((final_path.clone(), WatchEvent::Created, false));
            Ok(OpResult::Created { path: final_path })
        }
        Op::Delete { path, version } => {
            validate_path(path)?;
            let node = nodes
                .get(path)
                .ok_or_else(|| CoordError::NoNode(path.clone()))?;
            if let Some(expected) = version {
                if node.version != *expected {
                    return Err(CoordError::BadVersion {
                        path: path.clone(),
                        expected: *expected,
                        actual: node.version,
                    });
                }
            }
            if !child_names(nodes, path).is_empty() {
                return Err(CoordError::NotEmpty(path.clone()));
            }
            nodes.remove(path);
            if let Some(parent) = parent_path(path) {
                if let Some(parent_node) = nodes.get_mut(&parent) {
                    parent_node.cversion += 1;
                }
                events.push((parent, WatchEvent::ChildrenChanged, true));
            }
            events.push((path.clone(), WatchEvent::Deleted, false));
            Ok(OpResult::Deleted)
        }
        Op::Set {
            path,
            data,
            version,
        } => {
            validate_path(path)?;
            let node = nodes
                .get_mut(path)
                .ok_or_else(|| CoordError::NoNode(path.clone()))?;
            if let Some(expected) = version {
                if node.version != *expected {
                    return Err(CoordError::BadVersion {
                        path: path.clone(),
                        expected: *expected,
                        actual: node.version,
                    });
                }
            }
            node.data = data.clone();
            node.version += 1;
            let new_version = node.version;
            events.push((path.clone(), WatchEvent::DataChanged, false));
            Ok(OpResult::Set {
                version: new_version,
            })
        }
        Op::Check { path, version } => {
            validate_path(path)?;
            let node = nodes
                .get(path)
                .ok_or_else(|| CoordError::NoNode(path.clone()))?;
            if node.version != *version {
                return Err(CoordError::BadVersion {
                    path: path.clone(),
                    expected: *version,
                    actual: node.version,
                });
            }
            Ok(OpResult::Checked)
        }
    }
}

/// Fire and disarm matching one-shot watches.
fn fire(shared: &mut Shared, path: &str, event: WatchEvent, children_scope: bool) {
    let Some(watchers) = shared.watches.get_mut(path) else {
        return;
    };
    let mut kept = Vec::new();
    for watcher in watchers.drain(..) {
        let matches = match watcher.kind {
            WatchKind::Children => children_scope,
            WatchKind::Data => !children_scope && event != WatchEvent::Created,
            WatchKind::Exists => !children_scope,
        };
        if matches {
            let _ = watcher.tx.send(event);
        } else {
            kept.push(watcher);
        }
    }
    if kept.is_empty() {
        shared.watches.remove(path);
    } else {
        shared.watches.insert(path.to_string(), kept);
    }
}

impl MemorySession {
    fn check_alive(&self, shared: &Shared) -> Result<()> {
        if shared.unavailable {
            return Err(CoordError::ConnectionLoss);
        }
        if shared.expired.get(&self.id).copied().unwrap_or(true) {
            return Err(CoordError::SessionExpired);
        }
        Ok(())
    }

    fn arm_watch(&self, shared: &mut Shared, path: &str, kind: WatchKind) -> WatchFuture {
        let (tx, rx) = oneshot::channel();
        shared
            .watches
            .entry(path.to_string())
            .or_default()
            .push(WatcherRec {
                session: self.id,
                kind,
                tx,
            });
        WatchFuture::new(rx)
    }

    /// Single-shot ops report the plain op error, not a multi wrapper.
    fn run_single(&self, op: Op) -> Result<OpResult> {
        match self.run_multi(std::slice::from_ref(&op)) {
            Ok(mut results) => Ok(results.pop().expect("one result")),
            Err(CoordError::MultiFailed { source, .. }) => Err(*source),
            Err(other) => Err(other),
        }
    }

    fn run_multi(&self, ops: &[Op]) -> Result<Vec<OpResult>> {
        let mut shared = self.shared.lock().unwrap();
        self.check_alive(&shared)?;

        let mut scratch = shared.nodes.clone();
        let mut events = Vec::new();
        let mut results = Vec::with_capacity(ops.len());
        for (index, op) in ops.iter().enumerate() {
            match apply_op(&mut scratch, op, self.id, &mut events) {
                Ok(result) => results.push(result),
                Err(err) => {
                    return Err(CoordError::MultiFailed {
                        index,
                        source: Box::new(err),
                    })
                }
            }
        }
        shared.nodes = scratch;
        for (path, event, children_scope) in events {
            fire(&mut shared, &path, event, children_scope);
        }
        Ok(results)
    }
}

#[async_trait]
impl CoordSession for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn is_expired(&self) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.expired.get(&self.id).copied().unwrap_or(true)
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        let op = Op::Create {
            path: path.to_string(),
            data,
            mode,
        };
        match self.run_single(op)? {
            OpResult::Created { path } => Ok(path),
            _ => unreachable!("create returns a created result"),
        }
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        let shared = self.shared.lock().unwrap();
        self.check_alive(&shared)?;
        let node = shared
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        Ok((node.data.clone(), stat_of(&shared.nodes, path, node)))
    }

    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, Stat, WatchFuture)> {
        let mut shared = self.shared.lock().unwrap();
        self.check_alive(&shared)?;
        let (data, stat) = {
            let node = shared
                .nodes
                .get(path)
                .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
            (node.data.clone(), stat_of(&shared.nodes, path, node))
        };
        let watch = self.arm_watch(&mut shared, path, WatchKind::Data);
        Ok((data, stat, watch))
    }

    async fn set(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat> {
        let op = Op::Set {
            path: path.to_string(),
            data,
            version,
        };
        match self.run_single(op)? {
            OpResult::Set { version } => Ok(Stat {
                version,
                ..Stat::default()
            }),
            _ => unreachable!("set returns a set result"),
        }
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        let op = Op::Delete {
            path: path.to_string(),
            version,
        };
        self.run_single(op)?;
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let shared = self.shared.lock().unwrap();
        self.check_alive(&shared)?;
        if !shared.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        Ok(child_names(&shared.nodes, path))
    }

    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, WatchFuture)> {
        let mut shared = self.shared.lock().unwrap();
        self.check_alive(&shared)?;
        if !shared.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        let names = child_names(&shared.nodes, path);
        let watch = self.arm_watch(&mut shared, path, WatchKind::Children);
        Ok((names, watch))
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>> {
        let shared = self.shared.lock().unwrap();
        self.check_alive(&shared)?;
        Ok(shared
            .nodes
            .get(path)
            .map(|node| stat_of(&shared.nodes, path, node)))
    }

    async fn exists_watch(&self, path: &str) -> Result<(Option<Stat>, WatchFuture)> {
        let mut shared = self.shared.lock().unwrap();
        self.check_alive(&shared)?;
        let stat = shared
            .nodes
            .get(path)
            .map(|node| stat_of(&shared.nodes, path, node));
        let watch = self.arm_watch(&mut shared, path, WatchKind::Exists);
        Ok((stat, watch))
    }

    async fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResult>> {
        self.run_multi(&ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure_path;

    async fn session(coord: &MemoryCoordinator) -> Arc<dyn CoordSession> {
        coord.connect().await.expect("connect")
    }

    #[tokio::test]
    async fn sequential_names_are_monotonic_across_deletes() {
        let coord = MemoryCoordinator::new();
        let s = session(&coord).await;
        ensure_path(s.as_ref(), "/t/log").await.unwrap();

        let a = s
            .create("/t/log/log-", vec![], CreateMode::PersistentSequential)
            .await
            .unwrap();
        let b = s
            .create("/t/log/log-", vec![], CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(a, "/t/log/log-0000000000");
        assert_eq!(b, "/t/log/log-0000000001");

        s.delete(&b, None).await.unwrap();
        let c = s
            .create("/t/log/log-", vec![], CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(c, "/t/log/log-0000000002");
    }

    #[tokio::test]
    async fn ephemerals_vanish_on_expiry_and_watches_fire() {
        let coord = MemoryCoordinator::new();
        let owner = session(&coord).await;
        let other = session(&coord).await;
        ensure_path(owner.as_ref(), "/t/replicas/r1").await.unwrap();
        owner
            .create("/t/replicas/r1/is_active", vec![], CreateMode::Ephemeral)
            .await
            .unwrap();

        let (stat, watch) = other.exists_watch("/t/replicas/r1/is_active").await.unwrap();
        assert!(stat.is_some());

        coord.expire_session(owner.id());
        assert_eq!(watch.wait().await, WatchEvent::Deleted);
        assert!(other.exists("/t/replicas/r1/is_active").await.unwrap().is_none());
        assert!(owner.get("/t/replicas/r1").await.is_err());
    }

    #[tokio::test]
    async fn multi_is_atomic() {
        let coord = MemoryCoordinator::new();
        let s = session(&coord).await;
        ensure_path(s.as_ref(), "/t").await.unwrap();

        let err = s
            .multi(vec![
                Op::Create {
                    path: "/t/a".into(),
                    data: vec![1],
                    mode: CreateMode::Persistent,
                },
                Op::Check {
                    path: "/t/missing".into(),
                    version: 0,
                },
            ])
            .await
            .unwrap_err();
        match err {
            CoordError::MultiFailed { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected error: {other:?}"),
        }
        // First op must have rolled back.
        assert!(s.exists("/t/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn version_guards_reject_stale_writers() {
        let coord = MemoryCoordinator::new();
        let s = session(&coord).await;
        ensure_path(s.as_ref(), "/t").await.unwrap();
        s.create("/t/columns", b"v0".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        s.set("/t/columns", b"v1".to_vec(), Some(0)).await.unwrap();
        let err = s.set("/t/columns", b"v2".to_vec(), Some(0)).await.unwrap_err();
        assert!(matches!(
            err.unwrap_multi(),
            CoordError::BadVersion { actual: 1, .. }
        ));
    }

    #[tokio::test]
    async fn children_watch_fires_on_new_child() {
        let coord = MemoryCoordinator::new();
        let s = session(&coord).await;
        ensure_path(s.as_ref(), "/t/log").await.unwrap();
        let (names, watch) = s.children_watch("/t/log").await.unwrap();
        assert!(names.is_empty());
        s.create("/t/log/log-", vec![], CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(watch.wait().await, WatchEvent::ChildrenChanged);
    }

    #[tokio::test]
    async fn expired_session_watch_resolves_with_session_event() {
        let coord = MemoryCoordinator::new();
        let s = session(&coord).await;
        ensure_path(s.as_ref(), "/t/log").await.unwrap();
        let (_, watch) = s.children_watch("/t/log").await.unwrap();
        coord.expire_session(s.id());
        assert_eq!(watch.wait().await, WatchEvent::SessionExpired);
    }
}
