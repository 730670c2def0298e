//! Structure-change application.
//!
//! Watches the shared `/columns` and `/metadata` versions. When either moves,
//! the watcher takes the table-structure write lock, hands the new column
//! set to the local store, and advertises the applied versions under this
//! replica's subtree so the ALTER initiator can see who still lags.

use std::sync::Arc;

use repltree_coord::{CoordError, CoordSession, CreateMode, TablePaths};

use crate::error::Result;
use crate::storage::LocalStore;

/// In-process view of the table structure, guarded by the structure lock:
/// readers and writers take it shared, ALTER application takes it exclusive.
#[derive(Clone, Debug, Default)]
pub struct TableStructure {
    pub columns: Vec<String>,
    pub columns_version: i32,
    pub metadata_version: i32,
}

pub fn parse_columns(data: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(data)
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn format_columns(columns: &[String]) -> Vec<u8> {
    columns.join("\n").into_bytes()
}

pub struct AlterWatcher {
    paths: TablePaths,
    replica_name: String,
    structure: Arc<tokio::sync::RwLock<TableStructure>>,
    store: Arc<dyn LocalStore>,
}

impl AlterWatcher {
    pub fn new(
        paths: TablePaths,
        replica_name: &str,
        structure: Arc<tokio::sync::RwLock<TableStructure>>,
        store: Arc<dyn LocalStore>,
    ) -> Self {
        Self {
            paths,
            replica_name: replica_name.to_string(),
            structure,
            store,
        }
    }

    /// Apply any pending structure change. Returns whether something moved.
    pub async fn run_once(&self, session: &dyn CoordSession) -> Result<bool> {
        let (columns_data, columns_stat) = session.get(&self.paths.columns()).await?;
        let (_, metadata_stat) = session.get(&self.paths.metadata()).await?;

        let needs_update = {
            let structure = self.structure.read().await;
            columns_stat.version > structure.columns_version
                || metadata_stat.version > structure.metadata_version
        };
        if !needs_update {
            return Ok(false);
        }

        let mut structure = self.structure.write().await;
        // Re-check under the exclusive lock.
        if columns_stat.version > structure.columns_version {
            let new_columns = parse_columns(&columns_data);
            let added: Vec<&String> = new_columns
                .iter()
                .filter(|c| !structure.columns.contains(c))
                .collect();
            let removed: Vec<&String> = structure
                .columns
                .iter()
                .filter(|c| !new_columns.contains(c))
                .collect();
            tracing::info!(
                replica = %self.replica_name,
                version = columns_stat.version,
                ?added,
                ?removed,
                "applying column change"
            );
            self.store.apply_columns(&new_columns)?;
            structure.columns = new_columns;
            structure.columns_version = columns_stat.version;
            set_or_create(
                session,
                &self.paths.replica_columns(&self.replica_name),
                columns_data.clone(),
            )
            .await?;
        }
        if metadata_stat.version > structure.metadata_version {
            structure.metadata_version = metadata_stat.version;
            set_or_create(
                session,
                &self.paths.replica_metadata_version(&self.replica_name),
                metadata_stat.version.to_string().into_bytes(),
            )
            .await?;
        }
        Ok(true)
    }

    /// Watch handles for both version nodes; either firing means re-check.
    pub async fn watches(
        &self,
        session: &dyn CoordSession,
    ) -> Result<(repltree_coord::WatchFuture, repltree_coord::WatchFuture)> {
        let (_, _, columns_watch) = session.get_watch(&self.paths.columns()).await?;
        let (_, _, metadata_watch) = session.get_watch(&self.paths.metadata()).await?;
        Ok((columns_watch, metadata_watch))
    }
}

async fn set_or_create(session: &dyn CoordSession, path: &str, data: Vec<u8>) -> Result<()> {
    match session.set(path, data.clone(), None).await {
        Ok(_) => Ok(()),
        Err(CoordError::NoNode(_)) => {
            session.create(path, data, CreateMode::Persistent).await?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Initiator side: which live replica still has not applied `columns_data`?
pub async fn first_lagging_replica(
    session: &dyn CoordSession,
    table: &TablePaths,
    columns_data: &[u8],
) -> Result<Option<String>> {
    for replica in session.children(&table.replicas_dir()).await? {
        if session.exists(&table.is_active(&replica)).await?.is_none() {
            continue;
        }
        let applied = match session.get(&table.replica_columns(&replica)).await {
            Ok((data, _)) => data,
            Err(CoordError::NoNode(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        if applied != columns_data {
            return Ok(Some(replica));
        }
    }
    Ok(None)
}
