//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, carried by a Transport
//! what: RequestVote and AppendEntries requests/responses, RaftMessage envelope

use serde::{Deserialize, Serialize};

use crate::{LogEntry, NodeId, Term};

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: Option<u64>,
    pub last_log_term: Option<Term>,
}

/// Response to a vote request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when `entries` is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    /// Index of the entry preceding `entries`, `None` at the very start of the log
    pub prev_log_index: Option<u64>,
    pub prev_log_term: Option<Term>,
    pub entries: Vec<LogEntry>,
    pub leader_commit: Option<u64>,
}

impl AppendEntriesRequest {
    /// Index the first carried entry occupies
    pub fn first_index(&self) -> u64 {
        self.prev_log_index.map_or(0, |prev| prev + 1)
    }

    /// Index one past the last carried entry; the follower's next index on success
    pub fn end_index(&self) -> u64 {
        self.first_index() + self.entries.len() as u64
    }
}

/// Response to AppendEntries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
}

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    VoteRequest(RequestVoteRequest),
    VoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
}

impl RaftMessage {
    /// The term the sender was in
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::VoteRequest(m) => m.term,
            RaftMessage::VoteResponse(m) => m.term,
            RaftMessage::AppendEntries(m) => m.term,
            RaftMessage::AppendEntriesResponse(m) => m.term,
        }
    }
}
