use std::time::Duration;

use bytes::Bytes;
use swarmcast_core::crypto::{content_hash, split_and_hash};
use swarmcast_core::wire::{FrameCodec, InsertionPacket};
use swarmcast_services::{Distributor, MergeError, NodeError, NodeOptions};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Full-mesh distribution
// ══════════════════════════════════════════════════════════════════════════════

/// One publisher, three distributors, all-pairs relays. Every distributor
/// reassembles the published buffer.
#[tokio::test]
async fn test_three_way_mesh_reassembles_everywhere() {
    let mesh = full_mesh(3, NodeOptions::default(), NodeOptions::default())
        .await
        .unwrap();

    let report = mesh.publisher.publish(MESSAGE).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.attempted, 3);
    assert_eq!(report.delivered.len(), 3);

    let hash = content_hash(MESSAGE);
    for distributor in &mesh.distributors {
        let merged = distributor.lookup(&hash).await.unwrap();
        assert_eq!(&merged[..], MESSAGE);

        let stats = distributor.stats().await.unwrap();
        assert_eq!(stats.merged, 1);
        assert_eq!(stats.pending_lookups, 0);
    }

    mesh.close().await.unwrap();
}

/// Lookups issued before the publish block until the dataset is complete.
#[tokio::test]
async fn test_lookup_before_publish_waits() {
    let mesh = full_mesh(3, NodeOptions::default(), NodeOptions::default())
        .await
        .unwrap();
    let hash = content_hash(MESSAGE);

    let mesh = std::sync::Arc::new(mesh);
    let waiters: Vec<_> = (0..3)
        .map(|i| {
            let mesh = mesh.clone();
            let hash = hash.clone();
            tokio::spawn(async move { mesh.distributors[i].lookup(&hash).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(waiters.iter().all(|w| !w.is_finished()));

    mesh.publisher.publish(MESSAGE).await.unwrap();
    for waiter in waiters {
        assert_eq!(&waiter.await.unwrap().unwrap()[..], MESSAGE);
    }
    mesh.close().await.unwrap();
}

/// Buffers whose length is not a multiple of the peer count keep every byte.
#[tokio::test]
async fn test_uneven_buffers_survive_the_mesh() {
    let mesh = full_mesh(4, NodeOptions::default(), NodeOptions::default())
        .await
        .unwrap();

    for len in [4usize, 5, 7, 1021] {
        let buffer: Bytes = (0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<_>>().into();
        mesh.publisher.publish(buffer.clone()).await.unwrap();

        let hash = content_hash(&buffer);
        for distributor in &mesh.distributors {
            assert_eq!(distributor.lookup(&hash).await.unwrap(), buffer);
        }
    }

    let stats = mesh.distributors[0].stats().await.unwrap();
    assert_eq!(stats.datasets, 4);
    assert_eq!(stats.merged, 4);
    mesh.close().await.unwrap();
}

/// A lone distributor is a leaf: it receives the whole buffer as one shard.
#[tokio::test]
async fn test_single_distributor_leaf() {
    let mesh = full_mesh(1, NodeOptions::default(), NodeOptions::default())
        .await
        .unwrap();
    mesh.publisher.publish(MESSAGE).await.unwrap();

    let merged = mesh.distributors[0].lookup(&content_hash(MESSAGE)).await.unwrap();
    assert_eq!(&merged[..], MESSAGE);
    assert_eq!(mesh.distributors[0].forwarding_peers(), 0);
    mesh.close().await.unwrap();
}

/// More distributors than bytes is refused up front.
#[tokio::test]
async fn test_buffer_smaller_than_mesh_is_rejected() {
    let mesh = full_mesh(3, NodeOptions::default(), NodeOptions::default())
        .await
        .unwrap();

    let err = mesh.publisher.publish(&b"hi"[..]).await.unwrap_err();
    assert!(matches!(err, NodeError::BufferTooSmall { len: 2, peers: 3 }));
    mesh.close().await.unwrap();
}

/// A shard that does not match its split hash fails the lookup instead of
/// returning bad bytes.
#[tokio::test]
async fn test_corrupt_insertion_fails_lookup() {
    let (mut upstream, downstream) = tokio::io::duplex(LINK_BUFFER);
    let distributor = Distributor::new(Box::new(downstream), NodeOptions::default()).unwrap();

    let buffer = Bytes::from_static(MESSAGE);
    let hash = content_hash(&buffer);
    let (split_hashes, _) = split_and_hash(&buffer, 1).unwrap();
    let packet = InsertionPacket {
        hash: hash.clone(),
        split_hashes,
        buffer: Bytes::from_static(b"hellOworldworks"),
        index: 0,
    };
    FrameCodec::default().write(&mut upstream, &packet).await.unwrap();

    let err = distributor.lookup(&hash).await.unwrap_err();
    assert!(matches!(
        err,
        NodeError::Merge(MergeError::ShardCorrupt { index: 0 })
    ));
    assert_eq!(distributor.stats().await.unwrap().failed, 1);
    distributor.close().await.unwrap();
}
