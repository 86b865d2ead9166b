//! Outbound peer set shared by the inserter and the forwarder.
//!
//! Each attached peer gets a writer task draining a bounded packet queue and
//! a reader task that consumes the peer's meta-info heartbeats until the
//! stream ends. The owning actor drives the set from its own loop: it polls
//! [`PeerSet::next_event`] alongside its mailboxes and calls
//! [`PeerSet::deliver`] to fan packets out.

use std::collections::{BTreeMap, HashMap};

use swarmcast_core::wire::{Frame, FrameCodec, PeerMetaInfo, WireError};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};

use crate::error::NodeError;
use crate::lifecycle::Shutdown;
use crate::peer::{BoxConnection, PeerId, PeerIds, PeerTasks};
use crate::repair::{Delivery, DeliveryReport, FailedDelivery};

/// Something a peer's reader task observed.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    Meta(PeerId),
    Closed(PeerId),
}

struct WriteResult {
    peer: PeerId,
    index: usize,
    outcome: Result<(), WireError>,
}

struct OutboundPeer<P> {
    packets: mpsc::Sender<(usize, P)>,
    tasks: PeerTasks,
}

pub(crate) struct PeerSet<P> {
    role: &'static str,
    ids: PeerIds,
    /// Ordered by id, which is attach order.
    peers: BTreeMap<PeerId, OutboundPeer<P>>,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: mpsc::Receiver<PeerEvent>,
    results_tx: mpsc::Sender<WriteResult>,
    results_rx: mpsc::Receiver<WriteResult>,
    count: watch::Sender<usize>,
    codec: FrameCodec,
    queue_capacity: usize,
    shutdown: Shutdown,
}

impl<P: Frame + Send + Sync + 'static> PeerSet<P> {
    /// Returns the set and a receiver tracking its size.
    pub(crate) fn new(
        role: &'static str,
        codec: FrameCodec,
        queue_capacity: usize,
        shutdown: Shutdown,
    ) -> (Self, watch::Receiver<usize>) {
        let (events_tx, events_rx) = mpsc::channel(queue_capacity);
        let (results_tx, results_rx) = mpsc::channel(queue_capacity);
        let (count, count_rx) = watch::channel(0);
        let set = Self {
            role,
            ids: PeerIds::default(),
            peers: BTreeMap::new(),
            events_tx,
            events_rx,
            results_tx,
            results_rx,
            count,
            codec,
            queue_capacity,
            shutdown,
        };
        (set, count_rx)
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    /// Peer ids in attach order.
    pub(crate) fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub(crate) fn attach(&mut self, conn: BoxConnection) -> PeerId {
        let id = self.ids.next();
        let (reader, writer) = tokio::io::split(conn);
        let (packets_tx, packets_rx) = mpsc::channel(self.queue_capacity);

        let mut tasks = PeerTasks::default();
        tasks.push(tokio::spawn(write_loop(
            self.role,
            id,
            writer,
            packets_rx,
            self.results_tx.clone(),
            self.codec,
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(read_loop(
            self.role,
            id,
            reader,
            self.events_tx.clone(),
            self.codec,
            self.shutdown.clone(),
        )));

        self.peers.insert(
            id,
            OutboundPeer {
                packets: packets_tx,
                tasks,
            },
        );
        self.count.send_replace(self.peers.len());
        tracing::info!(role = self.role, peer = id, peers = self.peers.len(), "peer attached");
        id
    }

    /// Remove and close a peer. Returns false if it was already gone.
    pub(crate) fn remove(&mut self, id: PeerId, reason: &str) -> bool {
        let Some(peer) = self.peers.remove(&id) else {
            return false;
        };
        drop(peer.packets);
        peer.tasks.abort();
        self.count.send_replace(self.peers.len());
        tracing::info!(role = self.role, peer = id, peers = self.peers.len(), reason, "peer removed");
        true
    }

    pub(crate) fn remove_all(&mut self, reason: &str) {
        for id in self.ids() {
            self.remove(id, reason);
        }
    }

    /// Next reader-side event. Pending forever while no peer reports
    /// anything; the set holds a sender so the channel never closes.
    pub(crate) async fn next_event(&mut self) -> Option<PeerEvent> {
        self.events_rx.recv().await
    }

    pub(crate) fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Meta(peer) => tracing::trace!(role = self.role, peer, "peer meta info"),
            PeerEvent::Closed(peer) => {
                self.remove(peer, "peer disconnected");
            }
        }
    }

    /// Queue one packet per `(peer, index, packet)` and wait for every write
    /// result. Successes are recorded in `report` and failed peers removed.
    /// Returns the failed deliveries.
    pub(crate) async fn deliver(
        &mut self,
        plan: Vec<(PeerId, usize, P)>,
        report: &mut DeliveryReport,
    ) -> Result<Vec<FailedDelivery>, NodeError> {
        let mut failed = Vec::new();
        let mut outstanding: HashMap<PeerId, Vec<usize>> = HashMap::new();
        let mut awaiting = 0usize;

        for (peer_id, index, packet) in plan {
            let sent = match self.peers.get(&peer_id) {
                Some(peer) => {
                    tokio::select! {
                        biased;
                        _ = self.shutdown.triggered() => return Err(NodeError::Stopped(self.role)),
                        sent = peer.packets.send((index, packet)) => sent.is_ok(),
                    }
                }
                None => false,
            };
            if sent {
                outstanding.entry(peer_id).or_default().push(index);
                awaiting += 1;
            } else {
                failed.push(FailedDelivery {
                    peer: peer_id,
                    index,
                    error: "peer writer stopped".into(),
                });
                self.drop_failed(peer_id, report);
            }
        }

        while awaiting > 0 {
            let result = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => return Err(NodeError::Stopped(self.role)),
                result = self.results_rx.recv() => result.ok_or(NodeError::Stopped(self.role))?,
            };

            // Results from peers dropped earlier in this round are stale.
            let Some(indices) = outstanding.get_mut(&result.peer) else {
                continue;
            };
            let Some(pos) = indices.iter().position(|&i| i == result.index) else {
                continue;
            };
            indices.swap_remove(pos);
            awaiting -= 1;

            match result.outcome {
                Ok(()) => report.delivered.push(Delivery {
                    peer: result.peer,
                    index: result.index,
                }),
                Err(e) => {
                    tracing::warn!(
                        role = self.role,
                        peer = result.peer,
                        index = result.index,
                        error = %e,
                        "packet write failed"
                    );
                    failed.push(FailedDelivery {
                        peer: result.peer,
                        index: result.index,
                        error: e.to_string(),
                    });
                    // Anything still queued on this peer is lost with it.
                    for index in outstanding.remove(&result.peer).unwrap_or_default() {
                        awaiting -= 1;
                        failed.push(FailedDelivery {
                            peer: result.peer,
                            index,
                            error: "peer removed".into(),
                        });
                    }
                    self.drop_failed(result.peer, report);
                }
            }
        }

        Ok(failed)
    }

    fn drop_failed(&mut self, peer: PeerId, report: &mut DeliveryReport) {
        if self.remove(peer, "write failed") {
            report.removed.push(peer);
        }
    }
}

// ── Peer tasks ────────────────────────────────────────────────────────────────

async fn write_loop<P: Frame + Sync>(
    role: &'static str,
    peer: PeerId,
    mut writer: WriteHalf<BoxConnection>,
    mut packets: mpsc::Receiver<(usize, P)>,
    results: mpsc::Sender<WriteResult>,
    codec: FrameCodec,
    shutdown: Shutdown,
) {
    while let Some((index, packet)) = packets.recv().await {
        let outcome = codec.write(&mut writer, &packet).await;
        let result = WriteResult {
            peer,
            index,
            outcome,
        };
        if shutdown.send(&results, result, role).await.is_err() {
            break;
        }
    }
}

async fn read_loop(
    role: &'static str,
    peer: PeerId,
    mut reader: ReadHalf<BoxConnection>,
    events: mpsc::Sender<PeerEvent>,
    codec: FrameCodec,
    shutdown: Shutdown,
) {
    loop {
        match codec.read::<_, PeerMetaInfo>(&mut reader).await {
            Ok(Some(_)) => {
                if shutdown.send(&events, PeerEvent::Meta(peer), role).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) if e.is_disconnect() => break,
            Err(e) => {
                tracing::warn!(role, peer, error = %e, "bad frame from peer");
                break;
            }
        }
    }
    let _ = shutdown.send(&events, PeerEvent::Closed(peer), role).await;
}
