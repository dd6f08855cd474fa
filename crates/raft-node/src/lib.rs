//! # raft-node
//!
//! why: run consensus modules as live servers with real timers and durable logs
//! relations: drives raft-core's ConsensusModule over raft-storage's PersistedLog
//! what: RaftServer, RaftHandle, LocalNetwork, NodeConfig, thread-backed timers

pub mod config;
pub mod event;
pub mod handle;
pub mod network;
pub mod server;
pub mod timer;

pub use config::NodeConfig;
pub use event::Event;
pub use handle::{LocalClientRpc, RaftHandle};
pub use network::{LocalNetwork, PeerTransport};
pub use server::RaftServer;
pub use timer::{ThreadTimer, TimerService};
