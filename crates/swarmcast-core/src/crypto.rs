//! Content hashing for Swarmcast.
//!
//! Every integrity check in the system reduces to one primitive: a BLAKE3
//! digest of raw bytes, rendered as lowercase hex. The same function hashes
//! whole buffers (the dataset hash) and the shards cut from them (the split
//! hashes), so a receiver can verify either with no extra context.
//!
//! There is no unsafe code in this module.

use bytes::Bytes;
use thiserror::Error;

/// Hex-encoded BLAKE3 digest. 64 lowercase characters.
pub type ContentHash = String;

/// Length of a hex-encoded [`ContentHash`].
pub const HASH_HEX_LEN: usize = 64;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hash a byte slice and hex-encode the digest.
///
/// This is the content hash used on the wire and as the key of every
/// dataset in the store.
pub fn content_hash(data: &[u8]) -> ContentHash {
    hex::encode(hash(data))
}

/// Incremental BLAKE3 hasher for payloads that arrive in pieces.
///
/// # Example
/// ```
/// use swarmcast_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello");
/// h.update(b"world");
/// assert_eq!(h.finalize_hex(), swarmcast_core::crypto::content_hash(b"helloworld"));
/// ```
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize_hex(self) -> ContentHash {
        hex::encode(self.0.finalize().as_bytes())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Splitting ─────────────────────────────────────────────────────────────────

/// Split `buffer` into `count` contiguous shards and hash each one.
///
/// Shard sizes differ by at most one byte: the first `len % count` shards
/// carry the remainder. No byte of the input is dropped, so concatenating
/// the shards in index order always reproduces `buffer`.
///
/// The shards are zero-copy slices of `buffer`.
pub fn split_and_hash(
    buffer: &Bytes,
    count: usize,
) -> Result<(Vec<ContentHash>, Vec<Bytes>), SplitError> {
    if count == 0 {
        return Err(SplitError::ZeroShards);
    }
    if count > buffer.len() {
        return Err(SplitError::TooManyShards {
            shards: count,
            len: buffer.len(),
        });
    }

    let base = buffer.len() / count;
    let remainder = buffer.len() % count;

    let mut split_hashes = Vec::with_capacity(count);
    let mut split_buffers = Vec::with_capacity(count);

    let mut offset = 0;
    for i in 0..count {
        let size = base + usize::from(i < remainder);
        let shard = buffer.slice(offset..offset + size);
        split_hashes.push(content_hash(&shard));
        split_buffers.push(shard);
        offset += size;
    }

    Ok((split_hashes, split_buffers))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitError {
    #[error("cannot split into zero shards")]
    ZeroShards,

    #[error("cannot split {len} bytes into {shards} shards")]
    TooManyShards { shards: usize, len: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
