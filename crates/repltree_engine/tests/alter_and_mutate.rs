//! Structure changes and mutations flow to every replica.

mod common;

use std::time::Duration;

use common::{spawn_cluster, wait_until};
use repltree_engine::mutation::MutationCommand;
use repltree_engine::storage::LocalStore;
use repltree_engine::TableSettings;

#[tokio::test]
async fn column_change_reaches_every_replica() -> anyhow::Result<()> {
    let cluster = spawn_cluster(&["A", "B"], TableSettings::fast()).await;

    let columns: Vec<String> = ["user", "visits", "country"]
        .iter()
        .map(|c| c.to_string())
        .collect();
    let published = cluster.replica("A").table.alter_columns(&columns).await?;
    cluster
        .replica("A")
        .table
        .wait_for_alter(&published, Duration::from_secs(10))
        .await?;

    for replica in &cluster.replicas {
        assert_eq!(replica.store.table_columns(), columns, "replica {}", replica.name);
        let status = replica.table.status().await;
        assert_eq!(status.columns_version, 1);
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn mutation_rewrites_parts_on_every_replica() {
    let cluster = spawn_cluster(&["A", "B"], TableSettings::fast()).await;

    cluster
        .replica("A")
        .table
        .insert(
            "2024",
            &["user=7,1".into(), "user=8,1".into(), "user=9,1".into()],
            None,
            0,
        )
        .await
        .unwrap();
    wait_until(
        || cluster.replica("B").store.total_rows() == 3,
        Duration::from_secs(10),
        "part replicated before mutation",
    )
    .await;

    cluster
        .replica("A")
        .table
        .mutate(vec![MutationCommand::Delete {
            predicate: "user=7".into(),
        }])
        .await
        .unwrap();

    for replica in &cluster.replicas {
        let name = replica.name.clone();
        wait_until(
            || {
                let rows = replica.store.all_rows();
                rows.len() == 2 && rows.iter().all(|r| !r.contains("user=7"))
            },
            Duration::from_secs(10),
            &format!("mutation applied on {name}"),
        )
        .await;
        // The rewritten part carries the mutation suffix.
        assert!(replica
            .part_names()
            .iter()
            .all(|n| n.split('_').count() == 5));
    }

    cluster.shutdown().await;
}
