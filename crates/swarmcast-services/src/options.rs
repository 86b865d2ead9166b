//! Construction options shared by publishers, distributors and their actors.

use std::fmt;
use std::sync::Arc;

use swarmcast_core::config::{RepairStrategy, SwarmcastConfig};
use swarmcast_core::wire::FrameCodec;

use crate::qos::{ThrottleConfig, ThrottleOption};
use crate::repair::RepairPolicy;

#[derive(Clone)]
pub struct NodeOptions {
    /// Bound of every actor mailbox and per-peer packet queue.
    pub mailbox_capacity: usize,
    pub codec: FrameCodec,
    pub repair: Arc<dyn RepairPolicy>,
    /// Redistribution rounds a publish may run after the first.
    pub max_rounds: u32,
    pub throttle: Vec<ThrottleOption>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self::from_config(&SwarmcastConfig::default())
    }
}

impl fmt::Debug for NodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeOptions")
            .field("mailbox_capacity", &self.mailbox_capacity)
            .field("codec", &self.codec)
            .field("repair", &self.repair)
            .field("max_rounds", &self.max_rounds)
            .field("throttle", &self.throttle)
            .finish()
    }
}

impl NodeOptions {
    /// Options for one node. Throttle settings, if any, become fresh
    /// buckets on every call; clones of the result share them.
    pub fn from_config(config: &SwarmcastConfig) -> Self {
        Self {
            mailbox_capacity: config.actor.mailbox_capacity.max(1),
            codec: FrameCodec::new(config.wire.max_frame_bytes),
            repair: Arc::new(config.repair.strategy),
            max_rounds: config.repair.max_rounds,
            throttle: ThrottleConfig::options_from_settings(&config.throttle),
        }
    }

    /// Append throttle options; later ones win per direction.
    pub fn with_throttle(mut self, options: impl IntoIterator<Item = ThrottleOption>) -> Self {
        self.throttle.extend(options);
        self
    }

    pub fn with_repair(mut self, policy: impl RepairPolicy + 'static) -> Self {
        self.repair = Arc::new(policy);
        self
    }

    pub fn with_strategy(self, strategy: RepairStrategy) -> Self {
        self.with_repair(strategy)
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }
}
