use std::time::Duration;

use swarmcast_core::crypto::content_hash;
use swarmcast_services::{throttle_reading, throttle_writing, Bucket, NodeOptions};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Shared rate limiting
// ══════════════════════════════════════════════════════════════════════════════

const CAPACITY: u64 = 256;
const RATE: u64 = 128;

/// Every node shares one write bucket. The whole distribution cannot finish
/// faster than the bucket lets its bytes through.
#[tokio::test(start_paused = true)]
async fn test_shared_write_bucket_paces_the_mesh() {
    let bucket = Bucket::new(CAPACITY, RATE);
    let options = NodeOptions::default().with_throttle([throttle_writing(bucket.clone())]);
    let mesh = full_mesh(3, options.clone(), options).await.unwrap();

    // Every wrapped connection holds a view: three upstream links seen from
    // both ends plus six relay links seen from both ends.
    assert_eq!(bucket.active_views(), 18);

    let started = tokio::time::Instant::now();
    mesh.publisher.publish(MESSAGE).await.unwrap();
    let hash = content_hash(MESSAGE);
    for distributor in &mesh.distributors {
        assert_eq!(&distributor.lookup(&hash).await.unwrap()[..], MESSAGE);
    }
    let elapsed = started.elapsed();

    let written = bucket.consumed();
    assert!(written > CAPACITY, "only {written} bytes written");
    let floor = Duration::from_secs_f64((written - CAPACITY) as f64 / RATE as f64);
    assert!(
        elapsed + Duration::from_millis(50) >= floor,
        "{written} bytes in {elapsed:?}, expected at least {floor:?}"
    );

    mesh.close().await.unwrap();
    assert!(bucket.is_closed());
    assert_eq!(bucket.active_views(), 0);
}

/// Read and write buckets on every node; distribution still completes.
#[tokio::test(start_paused = true)]
async fn test_read_and_write_throttles_complete() {
    let read = Bucket::new(CAPACITY, RATE);
    let write = Bucket::new(CAPACITY, RATE);
    let options = NodeOptions::default()
        .with_throttle([throttle_reading(read.clone()), throttle_writing(write.clone())]);
    let mesh = full_mesh(3, options.clone(), options).await.unwrap();

    mesh.publisher.publish(MESSAGE).await.unwrap();
    let hash = content_hash(MESSAGE);
    for distributor in &mesh.distributors {
        assert_eq!(&distributor.lookup(&hash).await.unwrap()[..], MESSAGE);
    }
    assert!(read.consumed() > 0);
    assert!(write.consumed() > 0);

    mesh.close().await.unwrap();
    assert!(read.is_closed());
    assert!(write.is_closed());
}

/// A bucket stays open while any node still holds it.
#[tokio::test]
async fn test_bucket_outlives_first_closed_node() {
    let bucket = Bucket::new(CAPACITY, RATE);
    let options = NodeOptions::default().with_throttle([throttle_writing(bucket.clone())]);
    let mesh = full_mesh(2, options.clone(), options).await.unwrap();

    mesh.publisher.close().await.unwrap();
    assert!(!bucket.is_closed());
    mesh.distributors[0].close().await.unwrap();
    assert!(!bucket.is_closed());
    mesh.distributors[1].close().await.unwrap();
    assert!(bucket.is_closed());
}
