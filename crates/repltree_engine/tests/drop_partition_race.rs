//! DROP PARTITION while INSERTs race it: after every replica processed the
//! DROP_RANGE entry, no committed part below the drop fence survives
//! anywhere; other partitions are untouched.

mod common;

use std::time::Duration;

use common::{spawn_cluster, wait_for_same_parts};
use repltree_engine::part::PartInfo;
use repltree_engine::storage::LocalStore;
use repltree_engine::writer::InsertResult;
use repltree_engine::TableSettings;

#[tokio::test]
async fn drop_partition_with_concurrent_inserts_leaves_no_covered_part() {
    let cluster = spawn_cluster(&["A", "B"], TableSettings::fast()).await;

    for i in 0..3 {
        cluster
            .replica("A")
            .table
            .insert("2024", &[format!("u{i},1")], None, 0)
            .await
            .unwrap();
    }
    cluster
        .replica("A")
        .table
        .insert("2025", &["keep,1".into()], None, 0)
        .await
        .unwrap();
    wait_for_same_parts(&cluster, Duration::from_secs(10), "pre-drop convergence").await;

    // Fire inserts into the dropped partition concurrently with the DROP.
    let racer = {
        let table = cluster.replica("B").table.clone();
        tokio::spawn(async move {
            let mut landed = Vec::new();
            for i in 0..5 {
                if let Ok(InsertResult::Committed { part_name, .. }) = table
                    .insert("2024", &[format!("late{i},1")], None, 0)
                    .await
                {
                    landed.push(part_name);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            landed
        })
    };

    let (log_index, range_name) = cluster
        .replica("A")
        .table
        .drop_partition("2024", false)
        .await
        .unwrap();
    let racer_parts = racer.await.unwrap();

    cluster
        .replica("A")
        .table
        .wait_for_all_replicas_to_process_log_entry(
            log_index,
            &range_name,
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    wait_for_same_parts(&cluster, Duration::from_secs(10), "post-drop convergence").await;

    let range = PartInfo::parse(&range_name).unwrap();
    for replica in &cluster.replicas {
        for name in replica.part_names() {
            let info = PartInfo::parse(&name).unwrap();
            assert!(
                !range.covers(&info),
                "part {name} inside the dropped range survived on {}",
                replica.name
            );
        }
        // The other partition is intact.
        assert!(replica
            .part_names()
            .iter()
            .any(|n| n.starts_with("2025_")));
    }

    // Racing inserts either landed past the fence or were dropped with the
    // partition; parts past the fence must still exist everywhere.
    for part_name in racer_parts {
        let info = PartInfo::parse(&part_name).unwrap();
        if !range.covers(&info) {
            for replica in &cluster.replicas {
                let covered = replica
                    .store
                    .enumerate_active_parts()
                    .iter()
                    .any(|p| p.covers(&info));
                assert!(
                    covered,
                    "post-fence part {part_name} missing on {}",
                    replica.name
                );
            }
        }
    }

    cluster.shutdown().await;
}
