//! Collector — accepts shards relayed by other distributors' forwarders and
//! files them in the local content store.

use std::collections::BTreeMap;
use std::sync::Arc;

use swarmcast_core::wire::{ForwardingPacket, FrameCodec};
use tokio::sync::{mpsc, watch};

use crate::error::NodeError;
use crate::lifecycle::{ActorTask, Drained, Shutdown};
use crate::options::NodeOptions;
use crate::peer::{BoxConnection, PeerId, PeerIds, PeerTasks};
use crate::short;
use crate::store::{Chunk, ContentStore};

const ACTOR: &str = "collector";

enum Inbound {
    Packet(PeerId, ForwardingPacket),
    Closed(PeerId),
}

#[derive(Debug, Clone)]
pub struct Collector {
    add_peer_tx: mpsc::Sender<BoxConnection>,
    peer_count: watch::Receiver<usize>,
    task: Arc<ActorTask>,
}

impl Collector {
    pub fn new(store: ContentStore, options: &NodeOptions) -> Self {
        let cap = options.mailbox_capacity;
        let (add_peer_tx, add_peer_rx) = mpsc::channel(cap);
        let (inbound_tx, inbound_rx) = mpsc::channel(cap);
        let (count_tx, peer_count) = watch::channel(0);
        let (shutdown, drained) = Shutdown::new();

        let actor = CollectorActor {
            ids: PeerIds::default(),
            peers: BTreeMap::new(),
            add_peer_rx,
            inbound_tx,
            inbound_rx,
            peer_count: count_tx,
            store,
            codec: options.codec,
            shutdown: shutdown.clone(),
        };
        let task = ActorTask::spawn(ACTOR, shutdown, actor.run(drained));
        Self {
            add_peer_tx,
            peer_count,
            task,
        }
    }

    pub async fn add_peer(&self, conn: BoxConnection) -> Result<(), NodeError> {
        self.task.shutdown().send(&self.add_peer_tx, conn, ACTOR).await
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

struct CollectorActor {
    ids: PeerIds,
    peers: BTreeMap<PeerId, PeerTasks>,
    add_peer_rx: mpsc::Receiver<BoxConnection>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    peer_count: watch::Sender<usize>,
    store: ContentStore,
    codec: FrameCodec,
    shutdown: Shutdown,
}

impl CollectorActor {
    async fn run(mut self, _drained: Drained) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                conn = self.add_peer_rx.recv() => match conn {
                    Some(conn) => self.attach(conn),
                    None => break,
                },
                Some(inbound) = self.inbound_rx.recv() => match inbound {
                    Inbound::Packet(peer, packet) => self.collect(peer, packet).await,
                    Inbound::Closed(peer) => self.remove(peer, "peer disconnected"),
                },
            }
        }

        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            self.remove(id, "collector closing");
        }
        tracing::debug!("collector stopped");
    }

    fn attach(&mut self, conn: BoxConnection) {
        let id = self.ids.next();
        let mut tasks = PeerTasks::default();
        tasks.push(tokio::spawn(read_loop(
            id,
            conn,
            self.inbound_tx.clone(),
            self.codec,
            self.shutdown.clone(),
        )));
        self.peers.insert(id, tasks);
        self.peer_count.send_replace(self.peers.len());
        tracing::info!(peer = id, peers = self.peers.len(), "collector peer attached");
    }

    fn remove(&mut self, id: PeerId, reason: &str) {
        if let Some(tasks) = self.peers.remove(&id) {
            tasks.abort();
            self.peer_count.send_replace(self.peers.len());
            tracing::info!(peer = id, peers = self.peers.len(), reason, "collector peer removed");
        }
    }

    async fn collect(&mut self, peer: PeerId, packet: ForwardingPacket) {
        tracing::debug!(peer, hash = short(&packet.hash), index = packet.index, "shard collected");
        let chunk = Chunk {
            hash: packet.hash,
            buffer: packet.buffer,
            index: packet.index,
        };
        if let Err(e) = self.store.add_chunk(chunk).await {
            tracing::debug!(error = %e, "dropping collected shard");
        }
    }
}

async fn read_loop(
    peer: PeerId,
    mut conn: BoxConnection,
    inbound: mpsc::Sender<Inbound>,
    codec: FrameCodec,
    shutdown: Shutdown,
) {
    loop {
        match codec.read::<_, ForwardingPacket>(&mut conn).await {
            Ok(Some(packet)) => {
                if shutdown.send(&inbound, Inbound::Packet(peer, packet), ACTOR).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) if e.is_disconnect() => break,
            Err(e) => {
                tracing::warn!(peer, error = %e, "bad frame from forwarding peer");
                break;
            }
        }
    }
    let _ = shutdown.send(&inbound, Inbound::Closed(peer), ACTOR).await;
}
