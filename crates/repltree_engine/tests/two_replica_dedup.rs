//! Concurrent INSERTs with the same block_id produce exactly one part.

mod common;

use std::time::Duration;

use common::{spawn_cluster, wait_for_same_parts, wait_until};
use repltree_engine::writer::InsertResult;
use repltree_engine::TableSettings;

#[tokio::test]
async fn same_block_id_yields_one_part_everywhere() {
    let cluster = spawn_cluster(&["A", "B"], TableSettings::fast()).await;

    let rows_a: Vec<String> = (1..=1000).map(|i| format!("u{i},1")).collect();
    let first = cluster
        .replica("A")
        .table
        .insert("2024", &rows_a, Some("x"), 0)
        .await
        .unwrap();
    let InsertResult::Committed { part_name, .. } = first else {
        panic!("first insert cannot dedup");
    };
    assert_eq!(part_name, "2024_0_0_0");

    // Same dedup key with different payload: no new part.
    let rows_b: Vec<String> = (1..=10).map(|i| format!("other{i},9")).collect();
    let second = cluster
        .replica("B")
        .table
        .insert("2024", &rows_b, Some("x"), 0)
        .await
        .unwrap();
    assert_eq!(
        second,
        InsertResult::Deduplicated {
            part_name: "2024_0_0_0".into()
        }
    );

    wait_for_same_parts(&cluster, Duration::from_secs(10), "dedup convergence").await;
    for replica in &cluster.replicas {
        assert_eq!(replica.part_names(), vec!["2024_0_0_0"]);
        assert_eq!(replica.store.total_rows(), 1000);
    }
    // Byte-identical payloads on both replicas.
    assert_eq!(
        cluster.replica("A").store.all_rows(),
        cluster.replica("B").store.all_rows()
    );

    // A different block_id in the window does produce a new part.
    let third = cluster
        .replica("B")
        .table
        .insert("2024", &["z,1".into()], Some("y"), 0)
        .await
        .unwrap();
    assert!(matches!(third, InsertResult::Committed { .. }));
    wait_until(
        || cluster.replica("A").store.total_rows() == 1001,
        Duration::from_secs(10),
        "second insert replicated",
    )
    .await;

    cluster.shutdown().await;
}
