//! Publisher — the source node. Splits buffers across distributors.

use bytes::Bytes;

use crate::error::NodeError;
use crate::inserter::Inserter;
use crate::options::NodeOptions;
use crate::peer::{BoxConnection, PeerId};
use crate::qos::ThrottleConfig;
use crate::repair::DeliveryReport;

#[derive(Debug)]
pub struct Publisher {
    inserter: Inserter,
    throttle: ThrottleConfig,
}

impl Publisher {
    pub fn new(options: NodeOptions) -> Self {
        Self {
            inserter: Inserter::new(&options),
            throttle: ThrottleConfig::new(&options.throttle),
        }
    }

    /// Attach a distributor's upstream connection, applying this node's
    /// throttles.
    pub async fn add_peer(&self, conn: BoxConnection) -> Result<(), NodeError> {
        let conn = self.throttle.wrap(conn)?;
        self.inserter.add_peer(conn).await
    }

    pub async fn kill_peer(&self, peer: PeerId) -> Result<(), NodeError> {
        self.inserter.kill_peer(peer).await
    }

    /// Split `buffer` across all attached distributors.
    pub async fn publish(&self, buffer: impl Into<Bytes>) -> Result<DeliveryReport, NodeError> {
        self.inserter.publish(buffer.into()).await
    }

    pub fn peer_count(&self) -> usize {
        self.inserter.peer_count()
    }

    /// Stop the inserter, wait for it to drain and release the throttle
    /// buckets.
    pub async fn close(&self) -> Result<(), NodeError> {
        let result = self.inserter.close_and_wait().await;
        self.throttle.done();
        tracing::debug!("publisher closed");
        result.map_err(|e| NodeError::Close(vec![e]))
    }
}
