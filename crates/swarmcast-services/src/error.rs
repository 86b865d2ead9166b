//! Errors surfaced by Swarmcast nodes and their actors.

use thiserror::Error;

use crate::qos::RateLimitError;
use crate::repair::DeliveryReport;

/// Why a dataset failed to reassemble.
///
/// Merge outcomes are cached per dataset and handed to every waiting
/// lookup, so this type is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("shard {index} is missing")]
    MissingShard { index: usize },

    #[error("shard {index} does not match its split hash")]
    ShardCorrupt { index: usize },

    #[error("reassembled buffer does not match the dataset hash")]
    AggregateCorrupt,
}

#[derive(Debug, Error)]
pub enum NodeError {
    /// The named actor has been closed, or closed while the call was in flight.
    #[error("{0} stopped")]
    Stopped(&'static str),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("no peers attached")]
    NoPeers,

    #[error("buffer of {len} bytes cannot be split across {peers} peers")]
    BufferTooSmall { len: usize, peers: usize },

    #[error(
        "delivery incomplete: {} shard(s) undelivered across {} peer(s)",
        .0.failed.len(),
        .0.attempted
    )]
    PartialDelivery(DeliveryReport),

    #[error("no peer accepted delivery ({} attempted)", .0.attempted)]
    Undelivered(DeliveryReport),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error("{0} task panicked")]
    ActorPanicked(&'static str),

    #[error("{} component(s) failed to close", .0.len())]
    Close(Vec<NodeError>),
}

impl NodeError {
    /// The delivery report carried by a fan-out failure, if any.
    pub fn report(&self) -> Option<&DeliveryReport> {
        match self {
            Self::PartialDelivery(r) | Self::Undelivered(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }
}
