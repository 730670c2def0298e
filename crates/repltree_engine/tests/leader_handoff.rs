//! Leader hand-off: kill the leader's session, the next replica takes over,
//! merges keep flowing, and no duplicate MERGE entries appear in the log.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{spawn_cluster, wait_for_same_parts, wait_until, TABLE_PATH};
use repltree_coord::{CoordSession, Coordinator, TablePaths};
use repltree_engine::log_entry::{EntryType, LogEntry};
use repltree_engine::TableSettings;

#[tokio::test]
async fn next_replica_takes_over_and_merges_stay_unique() {
    let cluster = spawn_cluster(&["A", "B", "C"], TableSettings::fast()).await;

    wait_until(
        || cluster.replica("A").table.is_leader(),
        Duration::from_secs(5),
        "first replica leads",
    )
    .await;
    assert!(!cluster.replica("B").table.is_leader());
    assert!(!cluster.replica("C").table.is_leader());

    // Kill the leader's session. B holds the next-smallest election node.
    let _ = cluster
        .replica("A")
        .table
        .insert("2024", &["u1,1".into()], None, 0)
        .await
        .unwrap();
    cluster
        .coordinator
        .expire_session(session_of(&cluster, "A").await);

    wait_until(
        || cluster.replica("B").table.is_leader(),
        Duration::from_secs(10),
        "second replica takes over",
    )
    .await;

    // Writes and merges continue under the new leader. A recovers and
    // rejoins as a follower behind B.
    for i in 2..=4 {
        cluster
            .replica("B")
            .table
            .insert("2024", &[format!("u{i},1")], None, 0)
            .await
            .unwrap();
    }
    wait_until(
        || {
            cluster
                .replica("B")
                .part_names()
                .iter()
                .any(|name| name.ends_with("_1"))
        },
        Duration::from_secs(10),
        "new leader proposed a merge",
    )
    .await;
    wait_for_same_parts(&cluster, Duration::from_secs(10), "post-handoff convergence").await;

    let leaders = cluster
        .replicas
        .iter()
        .filter(|r| r.table.is_leader())
        .count();
    assert_eq!(leaders, 1, "exactly one leader after hand-off");
    assert!(cluster.replica("B").table.is_leader());

    // Every MERGE target appears exactly once in the log.
    let session = cluster.coordinator.connect().await.unwrap();
    let paths = TablePaths::new(TABLE_PATH);
    let mut merge_targets: HashMap<String, usize> = HashMap::new();
    for name in session.children(&paths.log_dir()).await.unwrap() {
        let (data, _) = session
            .get(&format!("{}/{}", paths.log_dir(), name))
            .await
            .unwrap();
        let entry = LogEntry::from_bytes(&data).unwrap();
        if entry.entry_type == EntryType::Merge {
            *merge_targets.entry(entry.new_part_name).or_insert(0) += 1;
        }
    }
    for (target, count) in &merge_targets {
        assert_eq!(*count, 1, "duplicate MERGE entries for {target}");
    }

    cluster.shutdown().await;
}

/// The coordinator session id a replica currently holds, read through the
/// ephemeral owner of its `is_active` node.
async fn session_of(cluster: &common::Cluster, name: &str) -> repltree_coord::SessionId {
    let session = cluster.coordinator.connect().await.unwrap();
    let paths = TablePaths::new(TABLE_PATH);
    session
        .exists(&paths.is_active(name))
        .await
        .unwrap()
        .expect("replica is active")
        .ephemeral_owner
}
