//! Peer connections and the per-peer tasks that drive them.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

/// Identifier assigned by the actor that owns a peer. Unique per actor.
pub type PeerId = u64;

/// Any bidirectional byte stream: a TCP socket, an in-memory duplex,
/// a throttled wrapper around either.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxConnection = Box<dyn Connection>;

/// Hands out peer ids in attach order.
#[derive(Debug, Default)]
pub(crate) struct PeerIds {
    next: PeerId,
}

impl PeerIds {
    pub(crate) fn next(&mut self) -> PeerId {
        self.next += 1;
        self.next
    }
}

/// Reader and writer tasks of one peer. Aborting them drops both halves
/// of the connection, which closes it.
#[derive(Debug, Default)]
pub(crate) struct PeerTasks {
    tasks: Vec<JoinHandle<()>>,
}

impl PeerTasks {
    pub(crate) fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub(crate) fn abort(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}
