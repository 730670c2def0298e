//! Quorum INSERT: the write completes once a peer fetched and acked, the
//! quorum pointer advances, and a late replica converges on its own.

mod common;

use std::time::Duration;

use common::{spawn_cluster, spawn_replica, wait_until, TABLE_PATH};
use repltree_coord::{CoordSession, Coordinator, TablePaths};
use repltree_engine::writer::InsertResult;
use repltree_engine::TableSettings;

#[tokio::test]
async fn quorum_of_two_completes_and_late_replica_catches_up() {
    let cluster = spawn_cluster(&["A", "B"], TableSettings::fast()).await;

    let result = cluster
        .replica("A")
        .table
        .insert("2024", &["u1,1".into(), "u2,2".into()], Some("q1"), 2)
        .await
        .unwrap();
    let InsertResult::Committed {
        part_name,
        quorum_satisfied,
        ..
    } = result
    else {
        panic!("first insert cannot dedup");
    };
    assert!(quorum_satisfied, "B acked, quorum of 2 holds");

    // The quorum pointer advanced and the status record is gone.
    let session = cluster.coordinator.connect().await.unwrap();
    let paths = TablePaths::new(TABLE_PATH);
    let (last_part, _) = session.get(&paths.quorum_last_part("2024")).await.unwrap();
    assert_eq!(last_part, part_name.as_bytes());
    assert!(session.exists(&paths.quorum_status()).await.unwrap().is_none());

    // Sequentially-consistent readers on A see the part.
    let visible = cluster.replica("A").table.sequential_parts().await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].name(), part_name);

    // A third replica joining later pulls the part and converges.
    let late = spawn_replica(&cluster.coordinator, "C", TableSettings::fast()).await;
    wait_until(
        || late.part_names() == vec![part_name.clone()],
        Duration::from_secs(10),
        "late replica fetched the quorum part",
    )
    .await;
    assert_eq!(late.store.total_rows(), 2);

    late.table.shutdown().await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn quorum_write_with_no_peer_times_out_and_rolls_back() {
    let settings = TableSettings {
        insert_quorum_timeout: Duration::from_millis(200),
        ..TableSettings::fast()
    };
    let cluster = spawn_cluster(&["A"], settings).await;

    let err = cluster
        .replica("A")
        .table
        .insert("2024", &["u1,1".into()], None, 2)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        repltree_engine::EngineError::QuorumTimeout(_)
    ));
    assert!(cluster.replica("A").part_names().is_empty());

    // The table keeps accepting ordinary writes afterwards.
    let ok = cluster
        .replica("A")
        .table
        .insert("2024", &["u2,1".into()], None, 0)
        .await
        .unwrap();
    assert!(matches!(ok, InsertResult::Committed { .. }));

    cluster.shutdown().await;
}
