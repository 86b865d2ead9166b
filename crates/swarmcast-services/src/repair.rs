//! Fan-out outcome reporting and repair policies.
//!
//! A publish or forward that loses some peers no longer aborts the node.
//! The fan-out collects a [`DeliveryReport`] and asks a [`RepairPolicy`]
//! what to do with it.

use std::fmt;

use swarmcast_core::config::RepairStrategy;

use crate::peer::PeerId;

/// One shard that reached a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub peer: PeerId,
    pub index: usize,
}

/// One shard that did not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDelivery {
    pub peer: PeerId,
    pub index: usize,
    pub error: String,
}

/// Outcome of a single publish or forward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Peers targeted by the first round.
    pub attempted: usize,
    pub delivered: Vec<Delivery>,
    /// Failures still unresolved when the fan-out finished.
    pub failed: Vec<FailedDelivery>,
    /// Peers dropped from the peer set during this fan-out.
    pub removed: Vec<PeerId>,
    /// Redistribution rounds run after the first.
    pub rounds: u32,
}

impl DeliveryReport {
    pub(crate) fn new(attempted: usize) -> Self {
        Self {
            attempted,
            ..Self::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Shard indices still missing from every peer, ascending.
    pub fn failed_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.failed.iter().map(|f| f.index).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

/// What to do after a fan-out with failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    Accept,
    Fail,
    Redistribute,
}

/// Pluggable decision for partially failed fan-outs.
///
/// Only consulted when at least one delivery failed and at least one peer
/// survived. A fan-out where every peer failed is always an error.
pub trait RepairPolicy: Send + Sync + fmt::Debug {
    fn decide(&self, report: &DeliveryReport) -> RepairAction;
}

impl RepairPolicy for RepairStrategy {
    fn decide(&self, _report: &DeliveryReport) -> RepairAction {
        match self {
            RepairStrategy::Accept => RepairAction::Accept,
            RepairStrategy::Fail => RepairAction::Fail,
            RepairStrategy::Redistribute => RepairAction::Redistribute,
        }
    }
}

/// Assign each failed shard index to a surviving peer, round-robin.
pub(crate) fn reassign(failed: &[usize], survivors: &[PeerId]) -> Vec<(PeerId, usize)> {
    if survivors.is_empty() {
        return Vec::new();
    }
    failed
        .iter()
        .zip(survivors.iter().cycle())
        .map(|(&index, &peer)| (peer, index))
        .collect()
}
