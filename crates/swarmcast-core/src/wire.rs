//! Swarmcast wire format — framing and packet records exchanged between peers.
//!
//! Every record travels as one frame: a fixed 8-byte [`FrameHeader`]
//! followed by a JSON body. The header lets a reader bound its allocation
//! and reject foreign or corrupt streams before parsing a single byte of
//! the body.
//!
//! The header is `#[repr(C)]` over plain bytes and uses zerocopy derives,
//! so encoding it is a borrow and decoding it is a copy. There is no unsafe
//! code in this module.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::ContentHash;

// ── Frame Header ─────────────────────────────────────────────────────────────

/// Precedes every frame on a peer connection.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    /// Wire format version. Currently 0x01.
    pub version: u8,

    /// Which record the body holds. See [`FrameKind`].
    pub kind: u8,

    /// Reserved, must be zero.
    pub reserved: [u8; 2],

    /// Body length in bytes, big-endian.
    pub length: [u8; 4],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 8]);

/// Size of [`FrameHeader`] on the wire.
pub const HEADER_LEN: usize = 8;

/// Current frame format version.
pub const FRAME_VERSION: u8 = 0x01;

/// Default upper bound on a single frame body.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

impl FrameHeader {
    pub fn new(kind: FrameKind, length: u32) -> Self {
        Self {
            version: FRAME_VERSION,
            kind: kind.into(),
            reserved: [0; 2],
            length: length.to_be_bytes(),
        }
    }

    pub fn body_len(&self) -> u32 {
        u32::from_be_bytes(self.length)
    }

    /// Check version, kind and reserved bytes.
    pub fn validate(&self) -> Result<FrameKind, WireError> {
        if self.version != FRAME_VERSION {
            return Err(WireError::UnknownVersion(self.version));
        }
        if self.reserved != [0; 2] {
            return Err(WireError::ReservedBytesSet);
        }
        FrameKind::try_from(self.kind)
    }
}

/// Record carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Publisher → distributor: one shard plus the full split metadata.
    Insertion = 0x01,

    /// Distributor → distributor: one shard, no metadata.
    Forwarding = 0x02,

    /// Distributor → publisher heartbeat.
    PeerMetaInfo = 0x03,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Insertion),
            0x02 => Ok(FrameKind::Forwarding),
            0x03 => Ok(FrameKind::PeerMetaInfo),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(k: FrameKind) -> u8 {
        k as u8
    }
}

// ── Records ──────────────────────────────────────────────────────────────────

/// A record that can travel in a frame.
pub trait Frame: Serialize + DeserializeOwned {
    const KIND: FrameKind;
}

/// One shard together with everything needed to validate and rebuild the
/// whole buffer: the dataset hash and the ordered split hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertionPacket {
    pub hash: ContentHash,
    pub split_hashes: Vec<ContentHash>,
    #[serde(with = "hex_bytes")]
    pub buffer: Bytes,
    pub index: usize,
}

impl InsertionPacket {
    /// The shard alone, as relayed between distributors.
    pub fn to_forwarding(&self) -> ForwardingPacket {
        ForwardingPacket {
            hash: self.hash.clone(),
            buffer: self.buffer.clone(),
            index: self.index,
        }
    }
}

impl Frame for InsertionPacket {
    const KIND: FrameKind = FrameKind::Insertion;
}

/// One shard of a dataset, without metadata. The remote either already
/// holds the metadata or will receive it from its own upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingPacket {
    pub hash: ContentHash,
    #[serde(with = "hex_bytes")]
    pub buffer: Bytes,
    pub index: usize,
}

impl Frame for ForwardingPacket {
    const KIND: FrameKind = FrameKind::Forwarding;
}

/// Heartbeat a distributor may send upstream to its publisher.
/// Empty for now; reserved for capability exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetaInfo {}

impl Frame for PeerMetaInfo {
    const KIND: FrameKind = FrameKind::PeerMetaInfo;
}

// ── Codec ────────────────────────────────────────────────────────────────────

/// Reads and writes frames on any async byte stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: u32) -> Self {
        Self { max_frame_bytes }
    }

    /// Serialize a frame into a contiguous buffer, header included.
    pub fn encode<F: Frame>(&self, frame: &F) -> Result<Vec<u8>, WireError> {
        let body = serde_json::to_vec(frame).map_err(WireError::Encode)?;
        let length = u32::try_from(body.len())
            .ok()
            .filter(|len| *len <= self.max_frame_bytes)
            .ok_or(WireError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_bytes,
            })?;

        let header = FrameHeader::new(F::KIND, length);
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Write one frame and flush.
    pub async fn write<W, F>(&self, writer: &mut W, frame: &F) -> Result<(), WireError>
    where
        W: AsyncWrite + Unpin,
        F: Frame,
    {
        let bytes = self.encode(frame)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    /// A stream that ends inside a frame is [`WireError::Truncated`].
    pub async fn read<R, F>(&self, reader: &mut R) -> Result<Option<F>, WireError>
    where
        R: AsyncRead + Unpin,
        F: Frame,
    {
        let mut header_buf = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = reader.read(&mut header_buf[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(WireError::Truncated)
                };
            }
            filled += n;
        }

        let header = FrameHeader::read_from(&header_buf[..]).ok_or(WireError::Truncated)?;
        let kind = header.validate()?;
        if kind != F::KIND {
            return Err(WireError::UnexpectedKind {
                expected: F::KIND,
                found: kind,
            });
        }

        let len = header.body_len();
        if len > self.max_frame_bytes {
            return Err(WireError::FrameTooLarge {
                len: len as usize,
                max: self.max_frame_bytes,
            });
        }

        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                WireError::Truncated
            } else {
                WireError::Io(e)
            }
        })?;

        serde_json::from_slice(&body)
            .map(Some)
            .map_err(WireError::Decode)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode frame body: {0}")]
    Encode(serde_json::Error),

    #[error("failed to decode frame body: {0}")]
    Decode(serde_json::Error),

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("expected {expected:?} frame, found {found:?}")]
    UnexpectedKind { expected: FrameKind, found: FrameKind },

    #[error("reserved header bytes are non-zero")]
    ReservedBytesSet,

    #[error("frame body of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: u32 },

    #[error("stream ended inside a frame")]
    Truncated,
}

impl WireError {
    /// True when the error only means the remote went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            WireError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

mod hex_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
