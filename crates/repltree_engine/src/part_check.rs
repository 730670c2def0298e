//! Background verification and repair of suspect parts.
//!
//! Suspects sit in a delayed queue. A check compares the local payload
//! checksums against what the coordinator has recorded; a mismatch or a
//! missing part unregisters it and enqueues a refetch. A part nobody has and
//! nothing will produce is reported as permanently lost.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use repltree_coord::{CoordError, CoordSession, TablePaths};

use crate::error::{EngineError, Result};
use crate::part::{PartChecksums, PartInfo};
use crate::queue::ReplicationQueue;
use crate::storage::LocalStore;
use crate::unix_time_ms;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    Healthy,
    /// Unregistered and queued for refetch.
    Repaired,
    /// No replica has it and nothing queued will produce it.
    Lost,
}

struct Suspect {
    part_name: String,
    due_ms: u64,
}

pub struct PartCheckTask {
    paths: TablePaths,
    replica_name: String,
    store: Arc<dyn LocalStore>,
    queue: Arc<ReplicationQueue>,
    pending: Mutex<VecDeque<Suspect>>,
    max_checks_per_pass: usize,
}

impl PartCheckTask {
    pub fn new(
        paths: TablePaths,
        replica_name: &str,
        store: Arc<dyn LocalStore>,
        queue: Arc<ReplicationQueue>,
        max_checks_per_pass: usize,
    ) -> Self {
        Self {
            paths,
            replica_name: replica_name.to_string(),
            store,
            queue,
            pending: Mutex::new(VecDeque::new()),
            max_checks_per_pass: max_checks_per_pass.max(1),
        }
    }

    /// Schedule a part for checking after `delay`.
    pub fn enqueue_part(&self, part_name: &str, delay: Duration) {
        let mut pending = self.pending.lock().unwrap();
        if pending.iter().any(|s| s.part_name == part_name) {
            return;
        }
        pending.push_back(Suspect {
            part_name: part_name.to_string(),
            due_ms: unix_time_ms() + delay.as_millis() as u64,
        });
    }

    pub fn parts_to_check(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Check every due suspect, bounded per pass.
    pub async fn run_pending(&self, session: &dyn CoordSession) -> Result<usize> {
        let now = unix_time_ms();
        let due: Vec<String> = {
            let mut pending = self.pending.lock().unwrap();
            let mut due = Vec::new();
            while due.len() < self.max_checks_per_pass {
                match pending.front() {
                    Some(suspect) if suspect.due_ms <= now => {
                        due.push(pending.pop_front().expect("front exists").part_name);
                    }
                    _ => break,
                }
            }
            due
        };
        let mut checked = 0;
        for part_name in due {
            match self.check_part(session, &part_name).await {
                Ok(outcome) => {
                    checked += 1;
                    if outcome == CheckOutcome::Repaired {
                        tracing::info!(part = %part_name, "suspect part queued for refetch");
                    }
                }
                Err(err) => {
                    tracing::warn!(part = %part_name, error = %err, "part check failed, rescheduling");
                    self.enqueue_part(&part_name, Duration::from_secs(5));
                }
            }
        }
        Ok(checked)
    }

    pub async fn check_part(
        &self,
        session: &dyn CoordSession,
        part_name: &str,
    ) -> Result<CheckOutcome> {
        let info = PartInfo::parse(part_name)?;
        let registered = self.registered_checksums(session, part_name).await?;
        let local = match self.store.checksum(part_name) {
            Ok(checksums) => Some(checksums),
            Err(EngineError::PartNotFound(_)) => None,
            Err(err) => return Err(err),
        };

        match (local, registered) {
            (Some(local), Some(recorded)) => {
                if local == recorded {
                    tracing::debug!(part = %part_name, "part checksums verified");
                    return Ok(CheckOutcome::Healthy);
                }
                tracing::warn!(part = %part_name, "checksum mismatch, removing and refetching");
                self.remove_and_refetch(session, part_name).await?;
                Ok(CheckOutcome::Repaired)
            }
            (Some(_), None) => {
                // Present locally, recorded nowhere. Leave it: commit is in
                // flight or the part is about to be covered.
                Ok(CheckOutcome::Healthy)
            }
            (None, Some(_)) => {
                tracing::warn!(part = %part_name, "registered part missing locally, refetching");
                self.remove_and_refetch(session, part_name).await?;
                Ok(CheckOutcome::Repaired)
            }
            (None, None) => {
                if self.queue.virtual_parts().covering(&info).is_some() {
                    // Some queued entry still produces it (or a cover).
                    return Ok(CheckOutcome::Healthy);
                }
                if self.any_replica_has(session, &info).await? {
                    self.queue
                        .add_fetch_entry(session, part_name.to_string())
                        .await?;
                    return Ok(CheckOutcome::Repaired);
                }
                tracing::error!(
                    part = %part_name,
                    "part is lost: no replica has it and no queue entry covers it"
                );
                Ok(CheckOutcome::Lost)
            }
        }
    }

    async fn remove_and_refetch(&self, session: &dyn CoordSession, part_name: &str) -> Result<()> {
        repltree_coord::delete_if_exists(
            session,
            &self.paths.part(&self.replica_name, part_name),
        )
        .await?;
        match self.store.remove_part(part_name) {
            Ok(()) | Err(EngineError::PartNotFound(_)) => {}
            Err(err) => return Err(err),
        }
        self.queue
            .add_fetch_entry(session, part_name.to_string())
            .await?;
        Ok(())
    }

    /// Checksums recorded for this replica, falling back to any replica.
    async fn registered_checksums(
        &self,
        session: &dyn CoordSession,
        part_name: &str,
    ) -> Result<Option<PartChecksums>> {
        let own = self.paths.part(&self.replica_name, part_name);
        match session.get(&own).await {
            Ok((data, _)) => return Ok(Some(PartChecksums::from_json(&data)?)),
            Err(CoordError::NoNode(_)) => {}
            Err(err) => return Err(err.into()),
        }
        for replica in session.children(&self.paths.replicas_dir()).await? {
            if replica == self.replica_name {
                continue;
            }
            match session.get(&self.paths.part(&replica, part_name)).await {
                Ok((data, _)) => return Ok(Some(PartChecksums::from_json(&data)?)),
                Err(CoordError::NoNode(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    async fn any_replica_has(
        &self,
        session: &dyn CoordSession,
        info: &PartInfo,
    ) -> Result<bool> {
        for replica in session.children(&self.paths.replicas_dir()).await? {
            if replica == self.replica_name {
                continue;
            }
            let parts = match session.children(&self.paths.parts_dir(&replica)).await {
                Ok(parts) => parts,
                Err(CoordError::NoNode(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            for name in parts {
                if PartInfo::parse(&name).map(|p| p.covers(info)).unwrap_or(false) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}
