//! QoS — byte-level token bucket throttling for peer connections.
//!
//! A [`Bucket`] holds the token state and may be shared by any number of
//! connections, across any number of nodes. Each wrapped connection takes a
//! [`BucketView`] on it; reads and writes draw one token per byte.
//!
//! Grants are partial: an operation gets as many bytes as there are whole
//! tokens (at least one), and waits for a refill only when the bucket is
//! empty. Bytes granted but not moved by the inner stream are refunded.
//!
//! Buckets are reference counted by their holders (node throttle configs).
//! When the last holder calls [`Bucket::done`] the bucket closes: its view
//! registry is cleared and new views are refused.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use swarmcast_core::config::{BucketSettings, ThrottleSettings};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use crate::peer::BoxConnection;

// ── Token state ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u64, refill_rate: u64) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_rate: refill_rate.max(1) as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Grant up to `want` bytes, or report how long until a grant is worth
    /// waiting for.
    fn take(&mut self, want: u64) -> Result<u64, Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            let granted = (self.tokens.floor() as u64).min(want).max(1);
            self.tokens -= granted as f64;
            return Ok(granted);
        }
        let target = (want as f64).min(self.capacity);
        let deficit = target - self.tokens;
        Err(Duration::from_secs_f64(deficit / self.refill_rate))
    }

    fn refund(&mut self, n: u64) {
        self.tokens = (self.tokens + n as f64).min(self.capacity);
    }
}

// ── Shared bucket ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct BucketInner {
    state: Mutex<TokenBucket>,
    /// Active views and the bytes each has consumed.
    views: DashMap<u64, u64>,
    next_view: AtomicU64,
    holders: AtomicUsize,
    closed: AtomicBool,
}

/// A shareable byte rate limiter.
#[derive(Debug, Clone)]
pub struct Bucket {
    inner: Arc<BucketInner>,
}

impl Bucket {
    /// `capacity` is the burst size in bytes, `rate` the refill in bytes per
    /// second. Both are clamped to at least 1.
    pub fn new(capacity: u64, rate: u64) -> Self {
        Self {
            inner: Arc::new(BucketInner {
                state: Mutex::new(TokenBucket::new(capacity, rate)),
                views: DashMap::new(),
                next_view: AtomicU64::new(0),
                holders: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_settings(settings: &BucketSettings) -> Self {
        Self::new(settings.capacity, settings.rate)
    }

    /// Register a new consumer.
    pub fn view(&self) -> Result<BucketView, RateLimitError> {
        if self.is_closed() {
            return Err(RateLimitError::Closed);
        }
        let id = self.inner.next_view.fetch_add(1, Ordering::Relaxed);
        self.inner.views.insert(id, 0);
        Ok(BucketView {
            bucket: self.clone(),
            id,
            released: false,
        })
    }

    /// Record one more holder. Each call must be paired with [`done`](Self::done).
    pub fn retain(&self) {
        self.inner.holders.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one holder. The last release closes the bucket.
    pub fn done(&self) {
        let prev = self
            .inner
            .holders
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |h| {
                Some(h.saturating_sub(1))
            })
            .unwrap_or(0);
        if prev <= 1 && !self.inner.closed.swap(true, Ordering::AcqRel) {
            let released = self.inner.views.len();
            self.inner.views.clear();
            tracing::debug!(released_views = released, "rate limit bucket closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn active_views(&self) -> usize {
        self.inner.views.len()
    }

    /// Bytes consumed by views that are still registered.
    pub fn consumed(&self) -> u64 {
        self.inner.views.iter().map(|v| *v.value()).sum()
    }

    fn take(&self, view: u64, want: u64) -> Result<u64, Duration> {
        let granted = match self.inner.state.lock() {
            Ok(mut state) => state.take(want)?,
            // Token state is plain numbers, still usable after a panic.
            Err(poisoned) => poisoned.into_inner().take(want)?,
        };
        if let Some(mut consumed) = self.inner.views.get_mut(&view) {
            *consumed += granted;
        }
        Ok(granted)
    }

    fn refund(&self, view: u64, n: u64) {
        if n == 0 {
            return;
        }
        match self.inner.state.lock() {
            Ok(mut state) => state.refund(n),
            Err(poisoned) => poisoned.into_inner().refund(n),
        }
        if let Some(mut consumed) = self.inner.views.get_mut(&view) {
            *consumed = consumed.saturating_sub(n);
        }
    }
}

/// One consumer's registration on a [`Bucket`]. Released on drop.
#[derive(Debug)]
pub struct BucketView {
    bucket: Bucket,
    id: u64,
    released: bool,
}

impl BucketView {
    pub fn try_take(&self, want: usize) -> Result<usize, Duration> {
        self.bucket
            .take(self.id, want as u64)
            .map(|granted| granted as usize)
    }

    pub fn refund(&self, n: usize) {
        self.bucket.refund(self.id, n as u64);
    }

    /// Deregister from the bucket. Idempotent.
    pub fn done(&mut self) {
        if !self.released {
            self.released = true;
            self.bucket.inner.views.remove(&self.id);
        }
    }
}

impl Drop for BucketView {
    fn drop(&mut self) {
        self.done();
    }
}

// ── Node configuration ────────────────────────────────────────────────────────

/// Node option selecting a bucket for one direction.
#[derive(Debug, Clone)]
pub enum ThrottleOption {
    Reading(Bucket),
    Writing(Bucket),
}

pub fn throttle_reading(bucket: Bucket) -> ThrottleOption {
    ThrottleOption::Reading(bucket)
}

pub fn throttle_writing(bucket: Bucket) -> ThrottleOption {
    ThrottleOption::Writing(bucket)
}

/// The buckets a node applies to every connection it is given.
#[derive(Debug, Default)]
pub struct ThrottleConfig {
    read: Option<Bucket>,
    write: Option<Bucket>,
    released: AtomicBool,
}

impl ThrottleConfig {
    /// Later options override earlier ones for the same direction.
    pub fn new(options: &[ThrottleOption]) -> Self {
        let mut read = None;
        let mut write = None;
        for option in options {
            match option {
                ThrottleOption::Reading(b) => read = Some(b.clone()),
                ThrottleOption::Writing(b) => write = Some(b.clone()),
            }
        }
        for bucket in read.iter().chain(write.iter()) {
            bucket.retain();
        }
        Self {
            read,
            write,
            released: AtomicBool::new(false),
        }
    }

    /// Options for private buckets built from configuration.
    pub fn options_from_settings(settings: &ThrottleSettings) -> Vec<ThrottleOption> {
        let mut options = Vec::new();
        if let Some(read) = &settings.read {
            options.push(ThrottleOption::Reading(Bucket::from_settings(read)));
        }
        if let Some(write) = &settings.write {
            options.push(ThrottleOption::Writing(Bucket::from_settings(write)));
        }
        options
    }

    pub fn is_unthrottled(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    /// Wrap `conn` with this node's throttles. Returned unchanged when none apply.
    pub fn wrap(&self, conn: BoxConnection) -> Result<BoxConnection, RateLimitError> {
        if self.is_unthrottled() {
            return Ok(conn);
        }
        let read = self.read.as_ref().map(Bucket::view).transpose()?;
        let write = self.write.as_ref().map(Bucket::view).transpose()?;
        Ok(Box::new(Throttled::new(conn, read, write)))
    }

    /// Release this node's hold on its buckets. Idempotent.
    pub fn done(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for bucket in self.read.iter().chain(self.write.iter()) {
            bucket.done();
        }
    }
}

// ── Throttled stream ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct Gate {
    view: BucketView,
    sleep: Option<Pin<Box<Sleep>>>,
    scratch: Vec<u8>,
}

impl Gate {
    fn new(view: BucketView) -> Self {
        Self {
            view,
            sleep: None,
            scratch: Vec::new(),
        }
    }

    fn poll_acquire(&mut self, cx: &mut Context<'_>, want: usize) -> Poll<usize> {
        loop {
            if let Some(sleep) = self.sleep.as_mut() {
                ready!(sleep.as_mut().poll(cx));
                self.sleep = None;
            }
            match self.view.try_take(want) {
                Ok(granted) => return Poll::Ready(granted),
                Err(wait) => self.sleep = Some(Box::pin(tokio::time::sleep(wait))),
            }
        }
    }
}

/// A stream whose reads and/or writes are paced by bucket views.
#[derive(Debug)]
pub struct Throttled<S> {
    inner: S,
    read: Option<Gate>,
    write: Option<Gate>,
}

impl<S> Throttled<S> {
    pub fn new(inner: S, read: Option<BucketView>, write: Option<BucketView>) -> Self {
        Self {
            inner,
            read: read.map(Gate::new),
            write: write.map(Gate::new),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Throttled<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let gate = match this.read.as_mut() {
            Some(gate) if buf.remaining() > 0 => gate,
            _ => return Pin::new(&mut this.inner).poll_read(cx, buf),
        };

        let granted = ready!(gate.poll_acquire(cx, buf.remaining()));
        gate.scratch.resize(granted, 0);
        let mut limited = ReadBuf::new(&mut gate.scratch[..granted]);
        match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let n = limited.filled().len();
                buf.put_slice(limited.filled());
                gate.view.refund(granted - n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                gate.view.refund(granted);
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                gate.view.refund(granted);
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Throttled<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let gate = match this.write.as_mut() {
            Some(gate) if !data.is_empty() => gate,
            _ => return Pin::new(&mut this.inner).poll_write(cx, data),
        };

        let granted = ready!(gate.poll_acquire(cx, data.len()));
        match Pin::new(&mut this.inner).poll_write(cx, &data[..granted]) {
            Poll::Ready(Ok(n)) => {
                gate.view.refund(granted - n);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                gate.view.refund(granted);
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                gate.view.refund(granted);
                Poll::Pending
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("rate limit bucket is closed")]
    Closed,
}
