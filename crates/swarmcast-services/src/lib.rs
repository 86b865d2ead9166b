//! swarmcast-services — the actors that move shards between nodes.
//!
//! A [`Publisher`] splits buffers across distributors through its
//! [`Inserter`]. Each [`Distributor`] stores what it receives, relays it to
//! the other distributors through its [`Forwarder`], and takes their relays
//! in through its [`Collector`]. Lookups block on the [`ContentStore`] until
//! a dataset is complete and verified.

pub mod collector;
pub mod distributor;
pub mod error;
mod fanout;
pub mod forwarder;
pub mod inserter;
pub mod lifecycle;
pub mod options;
pub mod peer;
pub mod publisher;
pub mod qos;
pub mod receiver;
pub mod repair;
pub mod store;

pub use collector::Collector;
pub use distributor::Distributor;
pub use error::{MergeError, NodeError};
pub use forwarder::Forwarder;
pub use inserter::Inserter;
pub use options::NodeOptions;
pub use peer::{BoxConnection, Connection, PeerId};
pub use publisher::Publisher;
pub use qos::{throttle_reading, throttle_writing, Bucket, ThrottleOption};
pub use receiver::Receiver;
pub use repair::{DeliveryReport, RepairAction, RepairPolicy};
pub use store::{ContentStore, StoreStats};

/// Leading characters of a content hash, for log fields.
pub(crate) fn short(hash: &str) -> &str {
    hash.get(..16).unwrap_or(hash)
}
