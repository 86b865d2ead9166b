//! Forwarder — relays a received shard to every forwarding peer.
//!
//! Each forwarding peer is a collector on another distributor. The same
//! packet goes to all of them; a forward completes once every write has
//! reported back. A forwarder with no peers is a valid leaf and forwards to
//! nobody.

use std::sync::Arc;

use swarmcast_core::wire::ForwardingPacket;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::NodeError;
use crate::fanout::PeerSet;
use crate::lifecycle::{ActorTask, Drained, Shutdown};
use crate::options::NodeOptions;
use crate::peer::{BoxConnection, PeerId};
use crate::repair::{DeliveryReport, RepairAction, RepairPolicy};
use crate::short;

const ACTOR: &str = "forwarder";

struct ForwardRequest {
    packet: ForwardingPacket,
    reply: oneshot::Sender<Result<DeliveryReport, NodeError>>,
}

#[derive(Debug, Clone)]
pub struct Forwarder {
    add_peer_tx: mpsc::Sender<BoxConnection>,
    kill_tx: mpsc::Sender<PeerId>,
    forward_tx: mpsc::Sender<ForwardRequest>,
    peer_count: watch::Receiver<usize>,
    task: Arc<ActorTask>,
}

impl Forwarder {
    pub fn new(options: &NodeOptions) -> Self {
        let cap = options.mailbox_capacity;
        let (add_peer_tx, add_peer_rx) = mpsc::channel(cap);
        let (kill_tx, kill_rx) = mpsc::channel(cap);
        let (forward_tx, forward_rx) = mpsc::channel(cap);
        let (shutdown, drained) = Shutdown::new();
        let (peers, peer_count) = PeerSet::new(ACTOR, options.codec, cap, shutdown.clone());

        let actor = ForwarderActor {
            peers,
            add_peer_rx,
            kill_rx,
            forward_rx,
            repair: options.repair.clone(),
            shutdown: shutdown.clone(),
        };
        let task = ActorTask::spawn(ACTOR, shutdown, actor.run(drained));
        Self {
            add_peer_tx,
            kill_tx,
            forward_tx,
            peer_count,
            task,
        }
    }

    pub async fn add_peer(&self, conn: BoxConnection) -> Result<(), NodeError> {
        self.task.shutdown().send(&self.add_peer_tx, conn, ACTOR).await
    }

    pub async fn kill_peer(&self, peer: PeerId) -> Result<(), NodeError> {
        self.task.shutdown().send(&self.kill_tx, peer, ACTOR).await
    }

    /// Send `packet` to every forwarding peer and wait for all writes.
    pub async fn forward(&self, packet: ForwardingPacket) -> Result<DeliveryReport, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.task
            .shutdown()
            .send(&self.forward_tx, ForwardRequest { packet, reply }, ACTOR)
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

struct ForwarderActor {
    peers: PeerSet<ForwardingPacket>,
    add_peer_rx: mpsc::Receiver<BoxConnection>,
    kill_rx: mpsc::Receiver<PeerId>,
    forward_rx: mpsc::Receiver<ForwardRequest>,
    repair: Arc<dyn RepairPolicy>,
    shutdown: Shutdown,
}

impl ForwarderActor {
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
                req = self.forward_rx.recv() => match req {
                    Some(req) => {
                        let result = self.forward(req.packet).await;
                        let _ = req.reply.send(result);
                    }
                    None => break,
                },
            }
        }

        self.peers.remove_all("forwarder closing");
        tracing::debug!("forwarder stopped");
    }

    async fn forward(&mut self, packet: ForwardingPacket) -> Result<DeliveryReport, NodeError> {
        let peers = self.peers.ids();
        let mut report = DeliveryReport::new(peers.len());
        if peers.is_empty() {
            return Ok(report);
        }

        let index = packet.index;
        tracing::debug!(
            hash = short(&packet.hash),
            index,
            peers = peers.len(),
            "forwarding shard"
        );
        let plan = peers
            .into_iter()
            .map(|peer| (peer, index, packet.clone()))
            .collect();
        let failed = self.peers.deliver(plan, &mut report).await?;
        report.failed = failed;

        if report.failed.is_empty() {
            return Ok(report);
        }
        if report.delivered.is_empty() {
            tracing::warn!(hash = short(&packet.hash), index, "no peer accepted the forward");
            return Err(NodeError::Undelivered(report));
        }
        // A relay holds a single shard, so there is nothing to redistribute.
        match self.repair.decide(&report) {
            RepairAction::Fail => Err(NodeError::PartialDelivery(report)),
            RepairAction::Accept | RepairAction::Redistribute => Ok(report),
        }
    }
}
