//! # configuration
//!
//! why: track cluster membership, including joint (old+new) membership during reconfiguration
//! relations: fed by configuration entries in log.rs, consulted by node.rs for quorum and peers
//! what: ClusterConfiguration, ConfigurationState, ConfigurationHistory

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Phase of a membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigurationState {
    /// A single member set decides
    Stable,
    /// Old and new member sets must both agree
    Joint,
    /// New servers are receiving the log but do not vote yet
    Sync,
}

impl fmt::Display for ConfigurationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationState::Stable => write!(f, "stable"),
            ConfigurationState::Joint => write!(f, "joint"),
            ConfigurationState::Sync => write!(f, "sync"),
        }
    }
}

/// Membership adopted at log index `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    /// Log index of the configuration entry that introduced this membership
    pub id: u64,
    pub state: ConfigurationState,
    /// Current voting members
    pub prev: BTreeSet<NodeId>,
    /// Proposed members (JOINT), or servers catching up (SYNC); empty when STABLE
    pub next: BTreeSet<NodeId>,
}

impl ClusterConfiguration {
    /// Configuration described by a log entry at `id`
    pub fn from_entry(id: u64, prev: BTreeSet<NodeId>, next: BTreeSet<NodeId>) -> Self {
        let state = if next.is_empty() {
            ConfigurationState::Stable
        } else {
            ConfigurationState::Joint
        };
        Self {
            id,
            state,
            prev,
            next,
        }
    }

    /// Whether `candidates` form a quorum
    ///
    /// A quorum is a strict majority of the voting members. While JOINT, a strict
    /// majority of `prev` and a strict majority of `next` are both required.
    pub fn check_quorum(&self, candidates: &BTreeSet<NodeId>) -> bool {
        match self.state {
            ConfigurationState::Stable | ConfigurationState::Sync => {
                is_majority(candidates, &self.prev)
            }
            ConfigurationState::Joint => {
                is_majority(candidates, &self.prev) && is_majority(candidates, &self.next)
            }
        }
    }

    /// Servers whose votes and acknowledgements count
    pub fn voters(&self) -> BTreeSet<NodeId> {
        match self.state {
            ConfigurationState::Joint => self.prev.union(&self.next).copied().collect(),
            ConfigurationState::Stable | ConfigurationState::Sync => self.prev.clone(),
        }
    }

    /// Servers the leader replicates to, including ones still catching up
    pub fn replication_targets(&self) -> BTreeSet<NodeId> {
        self.prev.union(&self.next).copied().collect()
    }

    pub fn contains_voter(&self, id: NodeId) -> bool {
        match self.state {
            ConfigurationState::Joint => self.prev.contains(&id) || self.next.contains(&id),
            ConfigurationState::Stable | ConfigurationState::Sync => self.prev.contains(&id),
        }
    }

    /// Servers being added by the change in progress
    pub fn joining(&self) -> BTreeSet<NodeId> {
        self.next.difference(&self.prev).copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.prev.is_empty() && self.next.is_empty()
    }
}

fn is_majority(candidates: &BTreeSet<NodeId>, members: &BTreeSet<NodeId>) -> bool {
    candidates.intersection(members).count() * 2 > members.len()
}

/// Every configuration found in the log, keyed by the index of its entry
///
/// The active configuration is always the one with the highest index, so truncating
/// the log's suffix reverts membership in lockstep.
#[derive(Debug, Clone)]
pub struct ConfigurationHistory {
    configurations: BTreeMap<u64, ClusterConfiguration>,
    empty: ClusterConfiguration,
}

impl Default for ConfigurationHistory {
    fn default() -> Self {
        Self {
            configurations: BTreeMap::new(),
            empty: ClusterConfiguration::from_entry(0, BTreeSet::new(), BTreeSet::new()),
        }
    }
}

impl ConfigurationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The configuration currently in force (empty if the log holds none)
    pub fn active(&self) -> &ClusterConfiguration {
        self.configurations
            .values()
            .next_back()
            .unwrap_or(&self.empty)
    }

    /// Whether any configuration entry has been seen
    pub fn is_configured(&self) -> bool {
        !self.configurations.is_empty()
    }

    /// Record the configuration entry found at `index`
    pub fn insert(&mut self, index: u64, prev: BTreeSet<NodeId>, next: BTreeSet<NodeId>) {
        log::debug!(
            "installing configuration {} prev={:?} next={:?}",
            index,
            prev,
            next
        );
        self.configurations
            .insert(index, ClusterConfiguration::from_entry(index, prev, next));
    }

    /// Drop every configuration adopted at or after `index`
    pub fn truncate_suffix(&mut self, index: u64) {
        let removed = self.configurations.split_off(&index);
        if !removed.is_empty() {
            log::debug!(
                "reverted {} configuration(s), active configuration is now {}",
                removed.len(),
                self.active().id
            );
        }
    }

    /// Start replicating to `next` without giving it a vote
    pub fn begin_sync(&mut self, next: BTreeSet<NodeId>) {
        if let Some(active) = self.configurations.values_mut().next_back() {
            active.state = ConfigurationState::Sync;
            active.next = next;
        }
    }

    /// Abandon a catch-up phase that never reached the joint entry
    pub fn abort_sync(&mut self) {
        if let Some(active) = self.configurations.values_mut().next_back() {
            if active.state == ConfigurationState::Sync {
                active.state = ConfigurationState::Stable;
                active.next.clear();
            }
        }
    }
}
