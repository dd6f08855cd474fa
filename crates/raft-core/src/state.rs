//! # state
//!
//! why: define the node roles, which role changes are legal, and the status other threads may read
//! relations: owned by node.rs; NodeStatus is shared with the runtime and clients
//! what: Role, RoleState, Progress, NodeStatus

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::{NodeId, Term};

/// The four roles a node can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
    /// Terminal state after shutdown or a durability fault
    Dead,
}

impl Default for Role {
    fn default() -> Self {
        Self::Follower
    }
}

impl Role {
    /// The transition table
    ///
    /// Every role may die. A follower may only become a candidate, a candidate may win,
    /// retry or yield, and a leader may only step down.
    pub fn can_transition_to(self, next: Role) -> bool {
        use Role::*;
        match (self, next) {
            (Dead, _) => false,
            (_, Dead) => true,
            (Follower, Follower) | (Follower, Candidate) => true,
            (Candidate, Candidate) | (Candidate, Follower) | (Candidate, Leader) => true,
            (Leader, Follower) => true,
            (Follower, Leader) | (Leader, Candidate) | (Leader, Leader) => false,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Role::Follower => 0,
            Role::Candidate => 1,
            Role::Leader => 2,
            Role::Dead => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Role::Follower,
            1 => Role::Candidate,
            2 => Role::Leader,
            _ => Role::Dead,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
            Role::Dead => write!(f, "dead"),
        }
    }
}

/// Replication progress the leader keeps for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Index of the next entry to send
    pub next_index: u64,
    /// Highest index known to match the leader's log
    pub match_index: Option<u64>,
}

/// Role together with the data that only exists in that role
#[derive(Debug, Clone)]
pub enum RoleState {
    Follower { leader: Option<NodeId> },
    Candidate { votes: BTreeSet<NodeId> },
    Leader { progress: BTreeMap<NodeId, Progress> },
    Dead,
}

impl RoleState {
    pub fn role(&self) -> Role {
        match self {
            RoleState::Follower { .. } => Role::Follower,
            RoleState::Candidate { .. } => Role::Candidate,
            RoleState::Leader { .. } => Role::Leader,
            RoleState::Dead => Role::Dead,
        }
    }
}

const NONE: u64 = u64::MAX;

fn encode(value: Option<u64>) -> u64 {
    value.unwrap_or(NONE)
}

fn decode(value: u64) -> Option<u64> {
    if value == NONE {
        None
    } else {
        Some(value)
    }
}

/// Scalars readable from any thread without touching the consensus module
///
/// Only the node's serialized context writes these.
#[derive(Debug)]
pub struct NodeStatus {
    id: NodeId,
    term: AtomicU64,
    role: AtomicU8,
    commit_index: AtomicU64,
    last_applied: AtomicU64,
    leader: AtomicU64,
}

impl NodeStatus {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            term: AtomicU64::new(0),
            role: AtomicU8::new(Role::Follower.as_u8()),
            commit_index: AtomicU64::new(NONE),
            last_applied: AtomicU64::new(NONE),
            leader: AtomicU64::new(NONE),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn term(&self) -> Term {
        self.term.load(Ordering::Acquire)
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    pub fn commit_index(&self) -> Option<u64> {
        decode(self.commit_index.load(Ordering::Acquire))
    }

    pub fn last_applied(&self) -> Option<u64> {
        decode(self.last_applied.load(Ordering::Acquire))
    }

    pub fn leader(&self) -> Option<NodeId> {
        decode(self.leader.load(Ordering::Acquire))
    }

    pub(crate) fn set_term(&self, term: Term) {
        self.term.store(term, Ordering::Release);
    }

    pub(crate) fn set_role(&self, role: Role) {
        self.role.store(role.as_u8(), Ordering::Release);
    }

    pub(crate) fn set_commit_index(&self, index: Option<u64>) {
        self.commit_index.store(encode(index), Ordering::Release);
    }

    pub(crate) fn set_last_applied(&self, index: Option<u64>) {
        self.last_applied.store(encode(index), Ordering::Release);
    }

    pub(crate) fn set_leader(&self, leader: Option<NodeId>) {
        self.leader.store(encode(leader), Ordering::Release);
    }
}
