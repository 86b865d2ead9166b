//! swarmcast-core — content hashing, wire format, and configuration.
//! All other Swarmcast crates depend on this one.

pub mod config;
pub mod crypto;
pub mod wire;

pub use crypto::{content_hash, split_and_hash, ContentHash};
pub use wire::{ForwardingPacket, FrameCodec, InsertionPacket, PeerMetaInfo, WireError};
