//! Receiver — reads insertion packets from the upstream publisher.
//!
//! Every packet registers its dataset's metadata, files the shard locally,
//! and hands the shard to the forwarder for the other distributors.

use std::sync::Arc;

use swarmcast_core::wire::{FrameCodec, InsertionPacket};

use crate::error::NodeError;
use crate::forwarder::Forwarder;
use crate::lifecycle::{ActorTask, Drained, Shutdown};
use crate::peer::BoxConnection;
use crate::short;
use crate::store::{Chunk, ContentStore, Metadata};

const ACTOR: &str = "receiver";

#[derive(Debug, Clone)]
pub struct Receiver {
    task: Arc<ActorTask>,
}

impl Receiver {
    pub fn new(
        upstream: BoxConnection,
        store: ContentStore,
        forwarder: Forwarder,
        codec: FrameCodec,
    ) -> Self {
        let (shutdown, drained) = Shutdown::new();
        let receiver = ReceiverTask {
            store,
            forwarder,
            codec,
            shutdown: shutdown.clone(),
        };
        let task = ActorTask::spawn(ACTOR, shutdown, receiver.run(upstream, drained));
        Self { task }
    }

    /// True once the upstream stream has ended or the receiver was closed.
    pub fn is_finished(&self) -> bool {
        self.task.shutdown().is_drained()
    }

    pub fn close(&self) {
        self.task.close();
    }

    pub async fn close_and_wait(&self) -> Result<(), NodeError> {
        self.task.close_and_wait().await
    }
}

struct ReceiverTask {
    store: ContentStore,
    forwarder: Forwarder,
    codec: FrameCodec,
    shutdown: Shutdown,
}

impl ReceiverTask {
    async fn run(self, mut upstream: BoxConnection, _drained: Drained) {
        loop {
            let read = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                read = self.codec.read::<_, InsertionPacket>(&mut upstream) => read,
            };
            let packet = match read {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    tracing::info!("upstream closed");
                    break;
                }
                Err(e) if e.is_disconnect() => {
                    tracing::info!(error = %e, "upstream disconnected");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "bad frame from upstream");
                    break;
                }
            };
            // A stalled forwarding peer must not hold the receiver open.
            let handled = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                handled = self.handle(packet) => handled,
            };
            if let Err(e) = handled {
                if e.is_stopped() {
                    tracing::debug!(error = %e, "receiver stopping");
                    break;
                }
                tracing::warn!(error = %e, "forward incomplete");
            }
        }
    }

    async fn handle(&self, packet: InsertionPacket) -> Result<(), NodeError> {
        tracing::debug!(hash = short(&packet.hash), index = packet.index, "shard received");
        let forwarding = packet.to_forwarding();

        self.store
            .add_metadata(Metadata {
                hash: packet.hash.clone(),
                split_hashes: packet.split_hashes,
            })
            .await?;
        self.store
            .add_chunk(Chunk {
                hash: packet.hash,
                buffer: packet.buffer,
                index: packet.index,
            })
            .await?;

        let report = self.forwarder.forward(forwarding).await?;
        tracing::trace!(delivered = report.delivered.len(), "shard forwarded");
        Ok(())
    }
}
