//! # event
//!
//! why: everything a node reacts to arrives through one queue, in one order
//! relations: produced by timer.rs, network.rs and handle.rs; consumed by server.rs
//! what: Event

use std::collections::BTreeSet;

use crossbeam_channel::Sender;

use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, RequestVoteRequest, RequestVoteResponse,
    Result, TimerEvent,
};

/// Work item for a node's event loop
#[derive(Debug)]
pub enum Event {
    /// A timer fired; `generation` tells a live arming from a superseded one
    Timer { event: TimerEvent, generation: u64 },

    RequestVote {
        from: NodeId,
        request: RequestVoteRequest,
    },
    RequestVoteReply {
        from: NodeId,
        request: RequestVoteRequest,
        reply: RequestVoteResponse,
    },
    AppendEntries {
        from: NodeId,
        request: AppendEntriesRequest,
    },
    AppendEntriesReply {
        from: NodeId,
        request: AppendEntriesRequest,
        reply: AppendEntriesResponse,
    },

    Bootstrap {
        members: BTreeSet<NodeId>,
        respond: Sender<Result<()>>,
    },
    ClientQuery {
        command: Vec<u8>,
        respond: Sender<Result<Vec<u8>>>,
    },
    Propose {
        command: Vec<u8>,
        respond: Sender<Result<u64>>,
    },
    GetConfiguration {
        respond: Sender<Result<(u64, BTreeSet<NodeId>)>>,
    },
    /// `respond` gets exactly one answer: the rejection, or the final outcome
    SetConfiguration {
        old_id: u64,
        members: BTreeSet<NodeId>,
        respond: Sender<Result<()>>,
    },

    Shutdown,
}
