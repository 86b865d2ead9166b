use anyhow::Result;
use swarmcast_core::crypto::content_hash;
use swarmcast_services::{Distributor, NodeOptions, Publisher};
use tokio::net::{TcpListener, TcpStream};

// ══════════════════════════════════════════════════════════════════════════════
//  Loopback TCP
// ══════════════════════════════════════════════════════════════════════════════

/// A connected pair of loopback sockets.
async fn tcp_pair() -> Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    Ok((client?, accepted?.0))
}

/// The same mesh as the in-memory tests, over real sockets.
#[tokio::test]
async fn test_two_distributors_over_tcp() {
    let publisher = Publisher::new(NodeOptions::default());
    let mut distributors = Vec::new();
    for _ in 0..2 {
        let (upstream, downstream) = tcp_pair().await.unwrap();
        let distributor = Distributor::new(Box::new(downstream), NodeOptions::default()).unwrap();
        distributors.push(distributor);
        publisher.add_peer(Box::new(upstream)).await.unwrap();
    }

    let (a_to_b, b_from_a) = tcp_pair().await.unwrap();
    distributors[0].add_forwarding_peer(Box::new(a_to_b)).await.unwrap();
    distributors[1].add_collector_peer(Box::new(b_from_a)).await.unwrap();
    let (b_to_a, a_from_b) = tcp_pair().await.unwrap();
    distributors[1].add_forwarding_peer(Box::new(b_to_a)).await.unwrap();
    distributors[0].add_collector_peer(Box::new(a_from_b)).await.unwrap();

    let message = b"shards over loopback sockets";
    publisher.publish(&message[..]).await.unwrap();

    let hash = content_hash(message);
    for distributor in &distributors {
        assert_eq!(&distributor.lookup(&hash).await.unwrap()[..], message);
    }

    publisher.close().await.unwrap();
    for distributor in &distributors {
        distributor.close().await.unwrap();
    }
}
