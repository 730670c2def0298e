//! Pausable background actions.
//!
//! External operations (backups, detaches) take an action lock to park
//! merges, fetches, sends or queue drainage without shutting the table
//! down. Locks are counted; an action runs only while its count is zero.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Merges,
    Fetches,
    Sends,
    QueueDrain,
}

#[derive(Default)]
pub struct ActionLocks {
    merges: AtomicUsize,
    fetches: AtomicUsize,
    sends: AtomicUsize,
    queue_drain: AtomicUsize,
}

impl ActionLocks {
    fn counter(&self, kind: ActionKind) -> &AtomicUsize {
        match kind {
            ActionKind::Merges => &self.merges,
            ActionKind::Fetches => &self.fetches,
            ActionKind::Sends => &self.sends,
            ActionKind::QueueDrain => &self.queue_drain,
        }
    }

    pub fn is_blocked(&self, kind: ActionKind) -> bool {
        self.counter(kind).load(Ordering::SeqCst) > 0
    }

    /// Block `kind` until the returned guard drops.
    pub fn stop(self: &Arc<Self>, kind: ActionKind) -> ActionLockGuard {
        self.counter(kind).fetch_add(1, Ordering::SeqCst);
        ActionLockGuard {
            locks: self.clone(),
            kind,
        }
    }
}

pub struct ActionLockGuard {
    locks: Arc<ActionLocks>,
    kind: ActionKind,
}

impl Drop for ActionLockGuard {
    fn drop(&mut self) {
        self.locks.counter(self.kind).fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_nest_and_release() {
        let locks = Arc::new(ActionLocks::default());
        assert!(!locks.is_blocked(ActionKind::Merges));
        let a = locks.stop(ActionKind::Merges);
        let b = locks.stop(ActionKind::Merges);
        assert!(locks.is_blocked(ActionKind::Merges));
        assert!(!locks.is_blocked(ActionKind::Fetches));
        drop(a);
        assert!(locks.is_blocked(ActionKind::Merges));
        drop(b);
        assert!(!locks.is_blocked(ActionKind::Merges));
    }
}
