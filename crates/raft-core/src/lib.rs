//! # raft-core
//!
//! why: implement the raft consensus algorithm independent of disks, sockets and threads
//! relations: raft-storage supplies a durable RaftLog, raft-node runs modules on event loops
//! what: consensus module, message types, log contract, membership, capability traits

pub mod config;
pub mod configuration;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod proxy;
pub mod state;
pub mod state_machine;
pub mod testing;
pub mod timer;
pub mod transport;

/// Identifies a server in the cluster
pub type NodeId = u64;

/// Election term; only ever grows
pub type Term = u64;

pub use self::config::RaftConfig;
pub use self::configuration::{ClusterConfiguration, ConfigurationHistory, ConfigurationState};
pub use self::error::{Error, Result};
pub use self::log::{EntryPayload, EntryType, LogEntry, LogMetadata, MemoryLog, RaftLog};
pub use self::message::{
    AppendEntriesRequest, AppendEntriesResponse, RaftMessage, RequestVoteRequest,
    RequestVoteResponse,
};
pub use self::node::{Completion, ConsensusModule};
pub use self::proxy::LeaderProxy;
pub use self::state::{NodeStatus, Progress, Role, RoleState};
pub use self::state_machine::StateMachine;
pub use self::timer::{Timer, TimerEvent, TimerId};
pub use self::transport::{ClientRpc, Transport};
