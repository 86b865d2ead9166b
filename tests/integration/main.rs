//! Swarmcast integration test harness.
//!
//! Every test builds its own nodes inside the test runtime and links them
//! with in-memory duplex streams (or loopback TCP in `tcp.rs`). Nothing is
//! shared between tests.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use swarmcast_services::{Distributor, NodeOptions, Publisher};

mod failures;
mod mesh;
mod shutdown;
mod tcp;
mod throttle;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const LINK_BUFFER: usize = 64 * 1024;
pub const MESSAGE: &[u8] = b"helloworldworks";

pub struct Mesh {
    pub publisher: Publisher,
    pub distributors: Vec<Distributor>,
    /// Switches for each distributor's upstream link, by distributor index.
    pub upstream_links: Vec<LinkSwitch>,
}

/// Build one publisher and `count` distributors, every distributor
/// forwarding to every other one.
pub async fn full_mesh(
    count: usize,
    publisher_options: NodeOptions,
    distributor_options: NodeOptions,
) -> Result<Mesh> {
    let publisher = Publisher::new(publisher_options);
    let mut distributors = Vec::with_capacity(count);
    let mut upstream_links = Vec::with_capacity(count);

    for i in 0..count {
        let (upstream, downstream) = tokio::io::duplex(LINK_BUFFER);
        let (upstream, switch) = Switchable::new(upstream);
        distributors.push(
            Distributor::new(Box::new(downstream), distributor_options.clone())
                .with_context(|| format!("distributor {i}"))?,
        );
        publisher.add_peer(Box::new(upstream)).await?;
        upstream_links.push(switch);
    }

    for (i, from) in distributors.iter().enumerate() {
        for (j, to) in distributors.iter().enumerate() {
            if i != j {
                let (forwarding, collecting) = tokio::io::duplex(LINK_BUFFER);
                from.add_forwarding_peer(Box::new(forwarding)).await?;
                to.add_collector_peer(Box::new(collecting)).await?;
            }
        }
    }

    wait_until(Duration::from_secs(5), || publisher.peer_count() == count).await?;
    Ok(Mesh {
        publisher,
        distributors,
        upstream_links,
    })
}

impl Mesh {
    pub async fn close(&self) -> Result<()> {
        self.publisher.close().await?;
        for distributor in &self.distributors {
            distributor.close().await?;
        }
        Ok(())
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

/// Turns a link's writes into broken-pipe errors. Reads are untouched, so
/// the far end never sees the link close.
#[derive(Clone, Default)]
pub struct LinkSwitch(Arc<AtomicBool>);

impl LinkSwitch {
    pub fn cut(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cut(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Switchable {
    inner: DuplexStream,
    switch: LinkSwitch,
}

impl Switchable {
    pub fn new(inner: DuplexStream) -> (Self, LinkSwitch) {
        let switch = LinkSwitch::default();
        (
            Self {
                inner,
                switch: switch.clone(),
            },
            switch,
        )
    }
}

impl AsyncRead for Switchable {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Switchable {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.switch.is_cut() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
