//! Broken-part self-heal: a corrupt copy is detected by the part check,
//! unregistered, refetched from a healthy peer and committed again.

mod common;

use std::time::Duration;

use common::{spawn_cluster, wait_until};
use repltree_engine::TableSettings;

#[tokio::test]
async fn corrupt_copy_is_refetched_from_healthy_peer() {
    let cluster = spawn_cluster(&["A", "B"], TableSettings::fast()).await;

    cluster
        .replica("A")
        .table
        .insert("2024", &["u1,1".into(), "u2,2".into()], None, 0)
        .await
        .unwrap();
    wait_until(
        || cluster.replica("B").part_names() == vec!["2024_0_0_0"],
        Duration::from_secs(10),
        "replica B fetched the part",
    )
    .await;

    let healthy_rows = cluster.replica("A").store.all_rows();

    // Damage B's copy and hand it to the part check.
    cluster
        .replica("B")
        .store
        .corrupt_part("2024_0_0_0")
        .unwrap();
    assert_ne!(cluster.replica("B").store.all_rows(), healthy_rows);
    cluster
        .replica("B")
        .table
        .enqueue_part_for_check("2024_0_0_0", Duration::ZERO);

    wait_until(
        || {
            cluster.replica("B").part_names() == vec!["2024_0_0_0"]
                && cluster.replica("B").store.all_rows() == healthy_rows
        },
        Duration::from_secs(10),
        "replica B healed the corrupt part",
    )
    .await;

    // The healthy copy was never touched.
    assert_eq!(cluster.replica("A").store.all_rows(), healthy_rows);
    assert_eq!(cluster.replica("A").part_names(), vec!["2024_0_0_0"]);

    cluster.shutdown().await;
}
