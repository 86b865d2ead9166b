use std::time::Duration;

use swarmcast_core::crypto::content_hash;
use swarmcast_services::{Distributor, NodeOptions, Publisher};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Shutdown
// ══════════════════════════════════════════════════════════════════════════════

/// Closing a distributor releases a lookup that would otherwise wait forever.
#[tokio::test]
async fn test_close_releases_pending_lookup() {
    let (_upstream, downstream) = tokio::io::duplex(LINK_BUFFER);
    let distributor = Distributor::new(Box::new(downstream), NodeOptions::default()).unwrap();
    let distributor = std::sync::Arc::new(distributor);

    let waiter = {
        let distributor = distributor.clone();
        tokio::spawn(async move { distributor.lookup(&content_hash(MESSAGE)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    distributor.close().await.unwrap();
    let err = waiter.await.unwrap().unwrap_err();
    assert!(err.is_stopped(), "{err}");
}

/// Closed nodes refuse new work and closing twice is harmless.
#[tokio::test]
async fn test_closed_nodes_refuse_work() {
    let mesh = full_mesh(2, NodeOptions::default(), NodeOptions::default())
        .await
        .unwrap();
    mesh.close().await.unwrap();
    mesh.close().await.unwrap();

    assert!(mesh.publisher.publish(MESSAGE).await.unwrap_err().is_stopped());
    assert_eq!(mesh.publisher.peer_count(), 0);

    let (a, _b) = tokio::io::duplex(64);
    assert!(mesh.distributors[0]
        .add_forwarding_peer(Box::new(a))
        .await
        .unwrap_err()
        .is_stopped());
    assert_eq!(mesh.distributors[0].forwarding_peers(), 0);
    assert_eq!(mesh.distributors[0].collector_peers(), 0);
}

/// Closing the publisher ends every distributor's upstream stream.
#[tokio::test]
async fn test_publisher_close_ends_upstreams() {
    let publisher = Publisher::new(NodeOptions::default());
    let (upstream, downstream) = tokio::io::duplex(LINK_BUFFER);
    let distributor = Distributor::new(Box::new(downstream), NodeOptions::default()).unwrap();
    publisher.add_peer(Box::new(upstream)).await.unwrap();
    publisher.publish(MESSAGE).await.unwrap();

    assert_eq!(
        &distributor.lookup(&content_hash(MESSAGE)).await.unwrap()[..],
        MESSAGE
    );
    publisher.close().await.unwrap();

    // The distributor keeps serving what it already holds.
    assert_eq!(
        &distributor.lookup(&content_hash(MESSAGE)).await.unwrap()[..],
        MESSAGE
    );
    distributor.close().await.unwrap();
}
