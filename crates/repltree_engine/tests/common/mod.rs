//! Shared helpers for integration tests.
//!
//! A test cluster is N `ReplicatedTable`s over one in-process coordinator,
//! each with its own `MemoryStore` and part-exchange server on a loopback
//! port.

use std::sync::Arc;
use std::time::{Duration, Instant};

use repltree_coord::MemoryCoordinator;
use repltree_engine::storage::{LocalStore, MemoryStore};
use repltree_engine::{ReplicatedTable, TableSettings};

pub const TABLE_PATH: &str = "/tables/test/visits";
pub const COLUMNS: [&str; 2] = ["user", "visits"];

pub struct Cluster {
    pub coordinator: MemoryCoordinator,
    pub replicas: Vec<Replica>,
}

pub struct Replica {
    pub name: String,
    pub store: Arc<MemoryStore>,
    pub table: Arc<ReplicatedTable>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub async fn spawn_cluster(names: &[&str], settings: TableSettings) -> Cluster {
    init_tracing();
    let coordinator = MemoryCoordinator::new();
    let mut replicas = Vec::new();
    for name in names {
        let replica = spawn_replica(&coordinator, name, settings.clone()).await;
        replicas.push(replica);
    }
    Cluster {
        coordinator,
        replicas,
    }
}

pub async fn spawn_replica(
    coordinator: &MemoryCoordinator,
    name: &str,
    settings: TableSettings,
) -> Replica {
    let store = Arc::new(MemoryStore::new());
    let table = ReplicatedTable::create(
        Arc::new(coordinator.clone()),
        store.clone(),
        TABLE_PATH,
        name,
        COLUMNS.iter().map(|c| c.to_string()).collect(),
        "127.0.0.1:0".parse().unwrap(),
        settings,
    )
    .await
    .expect("create table");
    table.startup().await.expect("startup");
    Replica {
        name: name.to_string(),
        store,
        table,
    }
}

impl Cluster {
    pub fn replica(&self, name: &str) -> &Replica {
        self.replicas
            .iter()
            .find(|r| r.name == name)
            .unwrap_or_else(|| panic!("no replica {name}"))
    }

    pub async fn shutdown(self) {
        for replica in &self.replicas {
            replica.table.shutdown().await;
        }
    }
}

impl Replica {
    pub fn part_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .store
            .enumerate_active_parts()
            .iter()
            .map(|p| p.name())
            .collect();
        names.sort();
        names
    }
}

/// Poll `pred` until it holds or the timeout trips.
pub async fn wait_until(mut pred: impl FnMut() -> bool, timeout: Duration, what: &str) {
    let deadline = Instant::now() + timeout;
    loop {
        if pred() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Every replica holds exactly the same sorted active part names.
pub async fn wait_for_same_parts(cluster: &Cluster, timeout: Duration, what: &str) {
    let deadline = Instant::now() + timeout;
    loop {
        let mut sets: Vec<Vec<String>> =
            cluster.replicas.iter().map(|r| r.part_names()).collect();
        sets.dedup();
        if sets.len() == 1 {
            return;
        }
        if Instant::now() >= deadline {
            panic!(
                "timed out waiting for convergence ({what}); part sets: {:?}",
                cluster
                    .replicas
                    .iter()
                    .map(|r| (r.name.clone(), r.part_names()))
                    .collect::<Vec<_>>()
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
