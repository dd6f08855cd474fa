//! # state_machine
//!
//! why: hand committed entries to the application without knowing what it does
//! relations: driven by node.rs whenever the commit index advances
//! what: StateMachine trait

use crate::LogEntry;

/// The application consuming the replicated log
pub trait StateMachine {
    /// Called exactly once per committed index, in index order
    fn apply(&mut self, index: u64, entry: &LogEntry);

    /// Serve a client query on the leader
    fn query(&mut self, command: &[u8]) -> Vec<u8>;
}
