//! Content store — collects shards per dataset, reassembles and verifies
//! them, and answers lookups.
//!
//! A single actor task owns all state. Shards may arrive before their
//! dataset's metadata; they are staged and adopted when the metadata lands.
//! A dataset merges exactly once all its shards are present. A successful
//! merge is final. A failed merge is cached and served to lookups, but is
//! re-attempted if a shard for that dataset changes.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use swarmcast_core::crypto::{content_hash, ContentHash, Hasher};
use tokio::sync::{mpsc, oneshot};

use crate::error::{MergeError, NodeError};
use crate::lifecycle::{ActorTask, Drained, Shutdown};
use crate::options::NodeOptions;
use crate::short;

const ACTOR: &str = "content store";

pub type MergeResult = Result<Bytes, MergeError>;

/// One shard of a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub hash: ContentHash,
    pub buffer: Bytes,
    pub index: usize,
}

/// The dataset hash and the ordered hashes of its shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub hash: ContentHash,
    pub split_hashes: Vec<ContentHash>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub datasets: usize,
    pub merged: usize,
    pub failed: usize,
    /// Datasets whose metadata is known but which still miss shards.
    pub incomplete: usize,
    /// Shards held for datasets without metadata yet.
    pub staged_chunks: usize,
    pub pending_lookups: usize,
}

enum StoreRequest {
    AddChunk(Chunk),
    AddMetadata(Metadata),
    Lookup {
        hash: ContentHash,
        reply: oneshot::Sender<MergeResult>,
    },
    Stats(oneshot::Sender<StoreStats>),
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cloneable handle to the content store actor.
#[derive(Debug, Clone)]
pub struct ContentStore {
    tx: mpsc::Sender<StoreRequest>,
    task: Arc<ActorTask>,
}

impl ContentStore {
    pub fn new(options: &NodeOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.mailbox_capacity);
        let (shutdown, drained) = Shutdown::new();
        let actor = StoreActor {
            rx,
            shutdown: shutdown.clone(),
            staged: HashMap::new(),
            datasets: HashMap::new(),
            lookups: HashMap::new(),
        };
        let task = ActorTask::spawn(ACTOR, shutdown, actor.run(drained));
        Self { tx, task }
    }

    pub async fn add_chunk(&self, chunk: Chunk) -> Result<(), NodeError> {
        self.request(StoreRequest::AddChunk(chunk)).await
    }

    pub async fn add_metadata(&self, metadata: Metadata) -> Result<(), NodeError> {
        self.request(StoreRequest::AddMetadata(metadata)).await
    }

    /// Wait for the dataset `hash` to merge and return its bytes.
    ///
    /// Blocks until every shard has arrived. A dataset that already merged,
    /// successfully or not, answers immediately.
    pub async fn lookup(&self, hash: &str) -> Result<Bytes, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreRequest::Lookup {
            hash: hash.to_owned(),
            reply,
        })
        .await?;
        let result = self.task.shutdown().recv(rx, ACTOR).await?;
        Ok(result?)
    }

    pub async fn stats(&self) -> Result<StoreStats, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreRequest::Stats(reply)).await?;
        self.task.shutdown().recv(rx, ACTOR).await
    }

    pub fn close(&self) {
        self.task.close();
    }

    pub async fn close_and_wait(&self) -> Result<(), NodeError> {
        self.task.close_and_wait().await
    }

    async fn request(&self, req: StoreRequest) -> Result<(), NodeError> {
        self.task.shutdown().send(&self.tx, req, ACTOR).await
    }
}

// ── Dataset ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Dataset {
    metadata: Metadata,
    chunks: HashMap<usize, Bytes>,
    merge_result: Option<MergeResult>,
}

impl Dataset {
    fn new(metadata: Metadata, chunks: HashMap<usize, Bytes>) -> Self {
        Self {
            metadata,
            chunks,
            merge_result: None,
        }
    }

    /// Enough shards to attempt a merge. Stray out-of-range indices count
    /// too, so the merge reports what is missing; they never block a later
    /// attempt once the real shard arrives.
    fn is_complete(&self) -> bool {
        self.chunks.len() >= self.metadata.split_hashes.len()
    }

    fn is_merged(&self) -> bool {
        matches!(self.merge_result, Some(Ok(_)))
    }

    /// Concatenate shards in index order, verifying each against its split
    /// hash and the whole against the dataset hash.
    fn merge(&self) -> MergeResult {
        let total: usize = self.chunks.values().map(Bytes::len).sum();
        let mut merged = Vec::with_capacity(total);
        let mut hasher = Hasher::new();

        for (index, expected) in self.metadata.split_hashes.iter().enumerate() {
            let chunk = self
                .chunks
                .get(&index)
                .ok_or(MergeError::MissingShard { index })?;
            if content_hash(chunk) != *expected {
                return Err(MergeError::ShardCorrupt { index });
            }
            hasher.update(chunk);
            merged.extend_from_slice(chunk);
        }

        if hasher.finalize_hex() != self.metadata.hash {
            return Err(MergeError::AggregateCorrupt);
        }
        Ok(Bytes::from(merged))
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

struct StoreActor {
    rx: mpsc::Receiver<StoreRequest>,
    shutdown: Shutdown,
    /// Shards whose dataset metadata has not arrived yet.
    staged: HashMap<ContentHash, HashMap<usize, Bytes>>,
    datasets: HashMap<ContentHash, Dataset>,
    lookups: HashMap<ContentHash, Vec<oneshot::Sender<MergeResult>>>,
}

impl StoreActor {
    async fn run(mut self, _drained: Drained) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                req = self.rx.recv() => match req {
                    Some(req) => self.handle(req),
                    None => break,
                },
            }
        }
        tracing::debug!(
            datasets = self.datasets.len(),
            abandoned_lookups = self.lookups.values().map(Vec::len).sum::<usize>(),
            "content store stopped"
        );
    }

    fn handle(&mut self, req: StoreRequest) {
        match req {
            StoreRequest::AddChunk(chunk) => self.add_chunk(chunk),
            StoreRequest::AddMetadata(metadata) => self.add_metadata(metadata),
            StoreRequest::Lookup { hash, reply } => self.lookup(hash, reply),
            StoreRequest::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn add_chunk(&mut self, chunk: Chunk) {
        let Some(dataset) = self.datasets.get_mut(&chunk.hash) else {
            self.staged
                .entry(chunk.hash)
                .or_default()
                .insert(chunk.index, chunk.buffer);
            return;
        };

        if dataset.is_merged() {
            tracing::trace!(hash = short(&chunk.hash), index = chunk.index, "dataset already merged");
            return;
        }

        let previous = dataset.chunks.insert(chunk.index, chunk.buffer.clone());
        let changed = previous.as_ref() != Some(&chunk.buffer);
        if changed || dataset.merge_result.is_none() {
            self.merge_and_notify(&chunk.hash);
        }
    }

    fn add_metadata(&mut self, metadata: Metadata) {
        if self.datasets.contains_key(&metadata.hash) {
            return;
        }
        let hash = metadata.hash.clone();
        let chunks = self.staged.remove(&hash).unwrap_or_default();
        tracing::debug!(
            hash = short(&hash),
            shards = metadata.split_hashes.len(),
            staged = chunks.len(),
            "dataset registered"
        );
        self.datasets.insert(hash.clone(), Dataset::new(metadata, chunks));
        self.merge_and_notify(&hash);
    }

    fn lookup(&mut self, hash: ContentHash, reply: oneshot::Sender<MergeResult>) {
        if let Some(result) = self.datasets.get(&hash).and_then(|d| d.merge_result.as_ref()) {
            let _ = reply.send(result.clone());
            return;
        }
        self.lookups.entry(hash).or_default().push(reply);
    }

    fn merge_and_notify(&mut self, hash: &str) {
        let Some(dataset) = self.datasets.get_mut(hash) else {
            return;
        };
        if !dataset.is_complete() {
            return;
        }

        let result = dataset.merge();
        match &result {
            Ok(bytes) => tracing::info!(hash = short(hash), bytes = bytes.len(), "dataset merged"),
            Err(e) => tracing::warn!(hash = short(hash), error = %e, "dataset merge failed"),
        }
        dataset.merge_result = Some(result.clone());

        for waiter in self.lookups.remove(hash).unwrap_or_default() {
            let _ = waiter.send(result.clone());
        }
    }

    fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            datasets: self.datasets.len(),
            staged_chunks: self.staged.values().map(HashMap::len).sum(),
            pending_lookups: self.lookups.values().map(Vec::len).sum(),
            ..StoreStats::default()
        };
        for dataset in self.datasets.values() {
            match &dataset.merge_result {
                Some(Ok(_)) => stats.merged += 1,
                Some(Err(_)) => stats.failed += 1,
                None => stats.incomplete += 1,
            }
        }
        stats
    }
}
