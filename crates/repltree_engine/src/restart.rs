//! Coordinator session ownership.
//!
//! One `SessionKeeper` per table holds the current session behind a lock so
//! the restart task can swap in a fresh one after expiry while every other
//! component keeps reading through the keeper. The restart task itself lives
//! in the table: probe, partial shutdown, recover. Only a full shutdown
//! stops it.

use std::sync::{Arc, RwLock};

use repltree_coord::{CoordSession, Coordinator};

use crate::error::Result;

pub struct SessionKeeper {
    coordinator: Arc<dyn Coordinator>,
    current: RwLock<Arc<dyn CoordSession>>,
}

impl SessionKeeper {
    pub async fn connect(coordinator: Arc<dyn Coordinator>) -> Result<Self> {
        let session = coordinator.connect().await?;
        Ok(Self {
            coordinator,
            current: RwLock::new(session),
        })
    }

    /// The current session. Calls fail with `SessionExpired` once it is
    /// gone; callers then leave recovery to the restart task.
    pub fn session(&self) -> Arc<dyn CoordSession> {
        self.current.read().unwrap().clone()
    }

    pub fn is_expired(&self) -> bool {
        self.current.read().unwrap().is_expired()
    }

    /// Open a fresh session and make it current.
    pub async fn renew(&self) -> Result<Arc<dyn CoordSession>> {
        let fresh = self.coordinator.connect().await?;
        let mut current = self.current.write().unwrap();
        *current = fresh.clone();
        tracing::info!(session = fresh.id(), "coordinator session renewed");
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repltree_coord::MemoryCoordinator;

    #[tokio::test]
    async fn renew_swaps_the_session() {
        let coord = MemoryCoordinator::new();
        let keeper = SessionKeeper::connect(Arc::new(coord.clone())).await.unwrap();
        let first = keeper.session().id();
        assert!(!keeper.is_expired());

        coord.expire_session(first);
        assert!(keeper.is_expired());

        let fresh = keeper.renew().await.unwrap();
        assert_ne!(fresh.id(), first);
        assert!(!keeper.is_expired());
        assert_eq!(keeper.session().id(), fresh.id());
    }
}
