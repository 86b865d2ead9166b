//! Two-phase actor shutdown.
//!
//! Every actor owns a [`Drained`] token and shares a [`Shutdown`] with its
//! handles and helper tasks. `trigger()` means "stop accepting work";
//! the actor observes it, tears down its peers and returns, which drops the
//! token and flips the drained flag that `close_and_wait` blocks on.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::NodeError;

/// Shared view of one actor's shutdown state.
#[derive(Clone, Debug)]
pub struct Shutdown {
    done: Arc<watch::Sender<bool>>,
    drained: watch::Receiver<bool>,
}

/// Held by the actor's run loop. Dropping it marks the actor drained,
/// including when the loop unwinds from a panic.
#[derive(Debug)]
pub struct Drained {
    drained: watch::Sender<bool>,
}

impl Drop for Drained {
    fn drop(&mut self) {
        self.drained.send_replace(true);
    }
}

impl Shutdown {
    pub fn new() -> (Self, Drained) {
        let (done, _) = watch::channel(false);
        let (drained_tx, drained_rx) = watch::channel(false);
        (
            Self {
                done: Arc::new(done),
                drained: drained_rx,
            },
            Drained {
                drained: drained_tx,
            },
        )
    }

    /// Stop accepting new work. Idempotent.
    pub fn trigger(&self) {
        self.done.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once [`trigger`](Self::trigger) has been called.
    pub async fn triggered(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn is_drained(&self) -> bool {
        *self.drained.borrow()
    }

    /// Resolves once the actor's run loop has exited.
    pub async fn drained(&self) {
        let mut rx = self.drained.clone();
        let _ = rx.wait_for(|drained| *drained).await;
    }

    /// Send into a mailbox unless shutdown fires first.
    pub async fn send<T>(
        &self,
        tx: &mpsc::Sender<T>,
        msg: T,
        actor: &'static str,
    ) -> Result<(), NodeError> {
        tokio::select! {
            biased;
            _ = self.triggered() => Err(NodeError::Stopped(actor)),
            sent = tx.send(msg) => sent.map_err(|_| NodeError::Stopped(actor)),
        }
    }

    /// Wait for a reply unless shutdown fires first.
    pub async fn recv<T>(&self, rx: oneshot::Receiver<T>, actor: &'static str) -> Result<T, NodeError> {
        tokio::select! {
            reply = rx => reply.map_err(|_| NodeError::Stopped(actor)),
            _ = self.triggered() => Err(NodeError::Stopped(actor)),
        }
    }
}

/// A spawned actor: its shutdown state plus the task handle, kept so the
/// first `close_and_wait` caller can surface a panic.
#[derive(Debug)]
pub(crate) struct ActorTask {
    name: &'static str,
    shutdown: Shutdown,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ActorTask {
    pub(crate) fn spawn<F>(name: &'static str, shutdown: Shutdown, run: F) -> Arc<Self>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(run);
        Arc::new(Self {
            name,
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub(crate) fn close(&self) {
        self.shutdown.trigger();
    }

    pub(crate) async fn close_and_wait(&self) -> Result<(), NodeError> {
        self.shutdown.trigger();

        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        match handle {
            Some(handle) => match handle.await {
                Err(e) if e.is_panic() => {
                    tracing::error!(actor = self.name, "actor task panicked");
                    Err(NodeError::ActorPanicked(self.name))
                }
                _ => Ok(()),
            },
            None => {
                self.shutdown.drained().await;
                Ok(())
            }
        }
    }
}
