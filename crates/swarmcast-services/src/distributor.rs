//! Distributor — a relay node.
//!
//! Owns a content store, a receiver on the upstream connection, a collector
//! for shards relayed by other distributors, and a forwarder that relays
//! the shards it receives directly. Wired into a full mesh, every
//! distributor ends up holding every shard of each published buffer.

use bytes::Bytes;

use crate::collector::Collector;
use crate::error::NodeError;
use crate::forwarder::Forwarder;
use crate::options::NodeOptions;
use crate::peer::BoxConnection;
use crate::qos::ThrottleConfig;
use crate::receiver::Receiver;
use crate::store::{ContentStore, StoreStats};

#[derive(Debug)]
pub struct Distributor {
    store: ContentStore,
    collector: Collector,
    forwarder: Forwarder,
    receiver: Receiver,
    throttle: ThrottleConfig,
}

impl Distributor {
    /// Start a distributor reading insertions from `upstream`.
    pub fn new(upstream: BoxConnection, options: NodeOptions) -> Result<Self, NodeError> {
        let throttle = ThrottleConfig::new(&options.throttle);
        let upstream = match throttle.wrap(upstream) {
            Ok(conn) => conn,
            Err(e) => {
                throttle.done();
                return Err(e.into());
            }
        };

        let store = ContentStore::new(&options);
        let collector = Collector::new(store.clone(), &options);
        let forwarder = Forwarder::new(&options);
        let receiver = Receiver::new(upstream, store.clone(), forwarder.clone(), options.codec);

        Ok(Self {
            store,
            collector,
            forwarder,
            receiver,
            throttle,
        })
    }

    /// Attach a connection on which another distributor forwards shards to us.
    pub async fn add_collector_peer(&self, conn: BoxConnection) -> Result<(), NodeError> {
        let conn = self.throttle.wrap(conn)?;
        self.collector.add_peer(conn).await
    }

    /// Attach a connection on which we forward shards to another distributor.
    pub async fn add_forwarding_peer(&self, conn: BoxConnection) -> Result<(), NodeError> {
        let conn = self.throttle.wrap(conn)?;
        self.forwarder.add_peer(conn).await
    }

    /// Wait for the dataset `hash` to be fully collected and return it.
    pub async fn lookup(&self, hash: &str) -> Result<Bytes, NodeError> {
        self.store.lookup(hash).await
    }

    pub async fn stats(&self) -> Result<StoreStats, NodeError> {
        self.store.stats().await
    }

    pub fn collector_peers(&self) -> usize {
        self.collector.peer_count()
    }

    pub fn forwarding_peers(&self) -> usize {
        self.forwarder.peer_count()
    }

    /// Stop every component, wait for inputs to drain before the store, and
    /// release the throttle buckets. Every component is closed even if an
    /// earlier one fails.
    pub async fn close(&self) -> Result<(), NodeError> {
        self.receiver.close();
        self.collector.close();
        self.forwarder.close();
        self.store.close();

        let results = [
            self.receiver.close_and_wait().await,
            self.collector.close_and_wait().await,
            self.forwarder.close_and_wait().await,
            self.store.close_and_wait().await,
        ];
        self.throttle.done();

        let errors: Vec<NodeError> = results.into_iter().filter_map(Result::err).collect();
        tracing::debug!(errors = errors.len(), "distributor closed");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(NodeError::Close(errors))
        }
    }
}
