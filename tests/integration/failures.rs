use std::time::Duration;

use swarmcast_core::config::RepairStrategy;
use swarmcast_core::crypto::content_hash;
use swarmcast_services::{NodeError, NodeOptions};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Partial delivery & repair
// ══════════════════════════════════════════════════════════════════════════════

fn publisher_options(strategy: RepairStrategy) -> NodeOptions {
    NodeOptions::default().with_strategy(strategy)
}

/// Cut one distributor's upstream link. Redistribution sends its shard to a
/// survivor, so every distributor that still has an upstream reassembles the
/// buffer. The cut-off distributor never receives the dataset metadata: it
/// only stages the relayed shards and its lookup stays pending.
#[tokio::test]
async fn test_redistribution_completes_survivors() {
    let mesh = full_mesh(
        3,
        publisher_options(RepairStrategy::Redistribute),
        NodeOptions::default(),
    )
    .await
    .unwrap();
    mesh.upstream_links[1].cut();

    let report = mesh.publisher.publish(MESSAGE).await.unwrap();
    assert!(report.is_complete(), "{report:?}");
    assert_eq!(report.rounds, 1);
    assert_eq!(report.removed.len(), 1);
    assert_eq!(mesh.publisher.peer_count(), 2);

    let hash = content_hash(MESSAGE);
    for i in [0, 2] {
        assert_eq!(&mesh.distributors[i].lookup(&hash).await.unwrap()[..], MESSAGE);
    }

    let cut_off = &mesh.distributors[1];
    let lookup = tokio::time::timeout(Duration::from_millis(200), cut_off.lookup(&hash)).await;
    assert!(lookup.is_err(), "lookup without metadata should stay pending");

    let staged = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = cut_off.stats().await.unwrap();
            if stats.staged_chunks == 3 {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(staged.datasets, 0);

    mesh.close().await.unwrap();
}

/// With the accept policy the publish succeeds degraded and the missing
/// shard is reported; nobody can reassemble the buffer.
#[tokio::test]
async fn test_accept_policy_reports_missing_shard() {
    let mesh = full_mesh(
        3,
        publisher_options(RepairStrategy::Accept),
        NodeOptions::default(),
    )
    .await
    .unwrap();
    mesh.upstream_links[2].cut();

    let report = mesh.publisher.publish(MESSAGE).await.unwrap();
    assert_eq!(report.failed_indices(), vec![2]);
    assert_eq!(report.delivered.len(), 2);

    let hash = content_hash(MESSAGE);
    let lookup = tokio::time::timeout(
        Duration::from_millis(200),
        mesh.distributors[0].lookup(&hash),
    )
    .await;
    assert!(lookup.is_err(), "lookup should still be waiting for shard 2");

    let stats = mesh.distributors[0].stats().await.unwrap();
    assert_eq!(stats.incomplete, 1);
    mesh.close().await.unwrap();
}

/// The fail policy turns a partial publish into an error carrying the report.
#[tokio::test]
async fn test_fail_policy_surfaces_partial_delivery() {
    let mesh = full_mesh(
        3,
        publisher_options(RepairStrategy::Fail),
        NodeOptions::default(),
    )
    .await
    .unwrap();
    mesh.upstream_links[0].cut();

    let err = mesh.publisher.publish(MESSAGE).await.unwrap_err();
    let report = err.report().expect("partial delivery carries a report");
    assert!(matches!(err, NodeError::PartialDelivery(_)));
    assert_eq!(report.failed_indices(), vec![0]);
    assert_eq!(report.attempted, 3);

    // The node keeps running with the surviving peers.
    assert_eq!(mesh.publisher.peer_count(), 2);
    let report = mesh.publisher.publish(&b"second buffer"[..]).await.unwrap();
    assert!(report.is_complete());
    mesh.close().await.unwrap();
}

/// Losing every upstream link is an error, not a panic.
#[tokio::test]
async fn test_all_links_cut_is_undelivered() {
    let mesh = full_mesh(2, NodeOptions::default(), NodeOptions::default())
        .await
        .unwrap();
    for link in &mesh.upstream_links {
        link.cut();
    }

    let err = mesh.publisher.publish(MESSAGE).await.unwrap_err();
    assert!(matches!(err, NodeError::Undelivered(_)));
    assert_eq!(mesh.publisher.peer_count(), 0);

    let err = mesh.publisher.publish(MESSAGE).await.unwrap_err();
    assert!(matches!(err, NodeError::NoPeers));
    mesh.close().await.unwrap();
}

/// Redistribution gives up after the configured number of rounds.
#[tokio::test]
async fn test_redistribution_round_limit() {
    let mesh = full_mesh(
        2,
        publisher_options(RepairStrategy::Redistribute).with_max_rounds(0),
        NodeOptions::default(),
    )
    .await
    .unwrap();
    mesh.upstream_links[1].cut();

    let err = mesh.publisher.publish(MESSAGE).await.unwrap_err();
    assert!(matches!(err, NodeError::PartialDelivery(_)));
    assert_eq!(err.report().unwrap().rounds, 0);
    mesh.close().await.unwrap();
}
