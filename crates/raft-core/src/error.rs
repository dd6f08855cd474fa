//! # error
//!
//! why: give every layer of the engine one vocabulary for failures
//! relations: returned by log storage, the consensus module, the leader proxy and the node runtime
//! what: Error enum, Result alias, fatal-fault classification

use crate::{NodeId, Term};
use thiserror::Error;

/// Result type used throughout the workspace
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by the log, the consensus module and client-facing operations
#[derive(Debug, Error)]
pub enum Error {
    /// `entry(index)` was asked for an index past the end of the log
    #[error("log index {index} out of range (last log index {last:?})")]
    OutOfRange { index: u64, last: Option<u64> },

    /// `entries(start, end)` was given bounds that do not describe a slice of the log
    #[error("invalid log range [{start}, {end}) for log of size {size}")]
    InvalidRange { start: u64, end: u64, size: u64 },

    /// writing or syncing durable state failed
    #[error("durable storage failure: {0}")]
    Durability(#[from] std::io::Error),

    /// an entry or the metadata record could not be encoded or decoded
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// on-disk state is inconsistent and cannot be recovered automatically
    #[error("corrupt log directory: {0}")]
    Corrupt(String),

    /// this node is not the leader; `leader` is a hint when one is known
    #[error("not the leader (leader hint: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// the caller's expected configuration id does not match the active one
    #[error("stale configuration id {expected}, active configuration is {actual}")]
    StaleConfiguration { expected: u64, actual: u64 },

    /// a membership change is already in progress
    #[error("configuration is not stable")]
    ConfigurationNotStable,

    /// the active configuration has not been committed yet
    #[error("configuration {id} is not committed yet")]
    ConfigurationNotCommitted { id: u64 },

    /// the term moved on before a pending operation could finish
    #[error("term changed from {from} before the operation completed")]
    TermChanged { from: Term },

    /// the node has shut down
    #[error("node is shut down")]
    Cancelled,

    /// the role transition table refused a transition
    #[error("illegal role transition from {from} to {to}")]
    IllegalTransition { from: crate::Role, to: crate::Role },

    /// bootstrap was requested on a node that already has durable state
    #[error("node already has a term, log or configuration; refusing to bootstrap")]
    AlreadyBootstrapped,

    /// no server in the cluster accepted the request as leader
    #[error("no leader found after {attempts} attempts")]
    NoLeader { attempts: usize },

    /// a configuration value failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// whether this error means the node can no longer vouch for its durable state
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Durability(_) | Error::Serialization(_) | Error::Corrupt(_)
        )
    }

    /// whether the caller should retry, typically against another node
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader { .. }
                | Error::Cancelled
                | Error::TermChanged { .. }
                | Error::ConfigurationNotStable
                | Error::ConfigurationNotCommitted { .. }
        )
    }
}
