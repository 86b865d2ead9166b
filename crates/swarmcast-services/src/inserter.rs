//! Inserter — splits a published buffer across its peers.
//!
//! Shard `i` of a buffer goes to the `i`-th attached peer (attach order), so
//! every peer receives a distinct piece plus the full metadata needed to
//! verify it. A publish waits for one write result per packet. Peers whose
//! write fails are removed, and the repair policy decides what happens to
//! their shards.

use std::sync::Arc;

use bytes::Bytes;
use swarmcast_core::crypto::{content_hash, split_and_hash, ContentHash};
use swarmcast_core::wire::InsertionPacket;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::NodeError;
use crate::fanout::PeerSet;
use crate::lifecycle::{ActorTask, Drained, Shutdown};
use crate::options::NodeOptions;
use crate::peer::{BoxConnection, PeerId};
use crate::repair::{self, DeliveryReport, RepairAction, RepairPolicy};
use crate::short;

const ACTOR: &str = "inserter";

struct PublishRequest {
    buffer: Bytes,
    reply: oneshot::Sender<Result<DeliveryReport, NodeError>>,
}

// ── Handle ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Inserter {
    add_peer_tx: mpsc::Sender<BoxConnection>,
    kill_tx: mpsc::Sender<PeerId>,
    publish_tx: mpsc::Sender<PublishRequest>,
    peer_count: watch::Receiver<usize>,
    task: Arc<ActorTask>,
}

impl Inserter {
    pub fn new(options: &NodeOptions) -> Self {
        let cap = options.mailbox_capacity;
        let (add_peer_tx, add_peer_rx) = mpsc::channel(cap);
        let (kill_tx, kill_rx) = mpsc::channel(cap);
        let (publish_tx, publish_rx) = mpsc::channel(cap);
        let (shutdown, drained) = Shutdown::new();
        let (peers, peer_count) = PeerSet::new(ACTOR, options.codec, cap, shutdown.clone());

        let actor = InserterActor {
            peers,
            add_peer_rx,
            kill_rx,
            publish_rx,
            repair: options.repair.clone(),
            max_rounds: options.max_rounds,
            shutdown: shutdown.clone(),
        };
        let task = ActorTask::spawn(ACTOR, shutdown, actor.run(drained));
        Self {
            add_peer_tx,
            kill_tx,
            publish_tx,
            peer_count,
            task,
        }
    }

    /// Attach a peer. It takes the next shard slot in attach order.
    pub async fn add_peer(&self, conn: BoxConnection) -> Result<(), NodeError> {
        self.task.shutdown().send(&self.add_peer_tx, conn, ACTOR).await
    }

    /// Remove and close a peer. Unknown ids are ignored.
    pub async fn kill_peer(&self, peer: PeerId) -> Result<(), NodeError> {
        self.task.shutdown().send(&self.kill_tx, peer, ACTOR).await
    }

    /// Split `buffer` across the current peers and wait for every write.
    pub async fn publish(&self, buffer: Bytes) -> Result<DeliveryReport, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.task
            .shutdown()
            .send(&self.publish_tx, PublishRequest { buffer, reply }, ACTOR)
            .await?;
        self.task.shutdown().recv(rx, ACTOR).await?
    }

    pub fn peer_count(&self) -> usize {
        *self.peer_count.borrow()
    }

    pub fn close(&self) {
        self.task.close();
    }

    pub async fn close_and_wait(&self) -> Result<(), NodeError> {
        self.task.close_and_wait().await
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

struct InserterActor {
    peers: PeerSet<InsertionPacket>,
    add_peer_rx: mpsc::Receiver<BoxConnection>,
    kill_rx: mpsc::Receiver<PeerId>,
    publish_rx: mpsc::Receiver<PublishRequest>,
    repair: Arc<dyn RepairPolicy>,
    max_rounds: u32,
    shutdown: Shutdown,
}

impl InserterActor {
    async fn run(mut self, _drained: Drained) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                conn = self.add_peer_rx.recv() => match conn {
                    Some(conn) => {
                        self.peers.attach(conn);
                    }
                    None => break,
                },
                Some(peer) = self.kill_rx.recv() => {
                    self.peers.remove(peer, "killed");
                }
                Some(event) = self.peers.next_event() => self.peers.handle_event(event),
                req = self.publish_rx.recv() => match req {
                    Some(req) => {
                        let result = self.publish(req.buffer).await;
                        let _ = req.reply.send(result);
                    }
                    None => break,
                },
            }
        }

        self.peers.remove_all("inserter closing");
        tracing::debug!("inserter stopped");
    }

    async fn publish(&mut self, buffer: Bytes) -> Result<DeliveryReport, NodeError> {
        let count = self.peers.len();
        if count == 0 {
            return Err(NodeError::NoPeers);
        }
        let hash = content_hash(&buffer);
        let (split_hashes, shards) =
            split_and_hash(&buffer, count).map_err(|_| NodeError::BufferTooSmall {
                len: buffer.len(),
                peers: count,
            })?;
        tracing::info!(hash = short(&hash), shards = count, bytes = buffer.len(), "publishing");

        let mut assignments: Vec<(PeerId, usize)> =
            self.peers.ids().into_iter().zip(0..count).collect();
        let mut report = DeliveryReport::new(count);

        loop {
            let plan = assignments
                .iter()
                .map(|&(peer, index)| (peer, index, packet(&hash, &split_hashes, &shards, index)))
                .collect();
            let failed = self.peers.deliver(plan, &mut report).await?;
            report.failed = failed;
            if report.failed.is_empty() {
                return Ok(report);
            }

            let survivors = self.peers.ids();
            if survivors.is_empty() {
                tracing::warn!(hash = short(&hash), "no peer accepted the publish");
                return Err(NodeError::Undelivered(report));
            }

            match self.repair.decide(&report) {
                RepairAction::Accept => {
                    tracing::warn!(
                        hash = short(&hash),
                        missing = ?report.failed_indices(),
                        "publish accepted with missing shards"
                    );
                    return Ok(report);
                }
                RepairAction::Fail => return Err(NodeError::PartialDelivery(report)),
                RepairAction::Redistribute if report.rounds < self.max_rounds => {
                    report.rounds += 1;
                    assignments = repair::reassign(&report.failed_indices(), &survivors);
                    tracing::info!(
                        hash = short(&hash),
                        round = report.rounds,
                        shards = assignments.len(),
                        "redistributing failed shards"
                    );
                }
                RepairAction::Redistribute => return Err(NodeError::PartialDelivery(report)),
            }
        }
    }
}

fn packet(
    hash: &ContentHash,
    split_hashes: &[ContentHash],
    shards: &[Bytes],
    index: usize,
) -> InsertionPacket {
    InsertionPacket {
        hash: hash.clone(),
        split_hashes: split_hashes.to_vec(),
        buffer: shards[index].clone(),
        index,
    }
}
