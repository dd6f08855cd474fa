//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, implemented durably by raft-storage
//! what: LogEntry, LogMetadata, the RaftLog storage contract, MemoryLog

use std::collections::BTreeSet;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{Error, NodeId, Result, Term};

/// Discriminant of a log entry's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// A command for the application state machine
    Normal,
    /// A cluster membership record
    Configuration,
}

/// What a log entry carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Opaque command bytes handed to the state machine once committed
    Normal(Vec<u8>),
    /// Membership record; `next` is non-empty only for a joint configuration
    Configuration {
        prev: BTreeSet<NodeId>,
        next: BTreeSet<NodeId>,
    },
}

/// A single entry in the replicated log
///
/// Entries are addressed by position: the first entry of a log has index 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The command or membership record
    pub payload: EntryPayload,
}

impl LogEntry {
    /// Create a new command entry
    pub fn new(term: Term, command: Vec<u8>) -> Self {
        Self {
            term,
            payload: EntryPayload::Normal(command),
        }
    }

    /// Create a membership entry; an empty `next` describes a stable configuration
    pub fn configuration(term: Term, prev: BTreeSet<NodeId>, next: BTreeSet<NodeId>) -> Self {
        Self {
            term,
            payload: EntryPayload::Configuration { prev, next },
        }
    }

    pub fn entry_type(&self) -> EntryType {
        match self.payload {
            EntryPayload::Normal(_) => EntryType::Normal,
            EntryPayload::Configuration { .. } => EntryType::Configuration,
        }
    }

    /// The command bytes, if this is a normal entry
    pub fn command(&self) -> Option<&[u8]> {
        match &self.payload {
            EntryPayload::Normal(command) => Some(command),
            EntryPayload::Configuration { .. } => None,
        }
    }
}

/// The durable per-node record besides the log itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMetadata {
    /// Latest term this node has seen
    pub term: Term,
    /// Candidate that received this node's vote in `term`
    pub vote: Option<NodeId>,
}

/// Storage contract the consensus module relies on
///
/// Every mutating call must be durable before it returns. Implementations report
/// bad indices as `Error::OutOfRange` / `Error::InvalidRange` and never clamp them.
pub trait RaftLog {
    /// The persisted metadata record, or `None` if none was ever written
    fn metadata(&self) -> Option<LogMetadata>;

    /// Overwrite the metadata record
    fn set_metadata(&mut self, metadata: LogMetadata) -> Result<()>;

    /// Number of entries in the log
    fn log_size(&self) -> u64;

    /// Index of the last entry, `None` if empty
    fn last_log_index(&self) -> Option<u64> {
        self.log_size().checked_sub(1)
    }

    /// Term of the last entry, `None` if empty
    fn last_log_term(&self) -> Option<Term>;

    fn entry(&self, index: u64) -> Result<LogEntry>;

    /// Entries in `[start, end)`
    fn entries(&self, start: u64, end: u64) -> Result<Vec<LogEntry>>;

    /// Append entries in order, returning the index range they now occupy
    fn append(&mut self, entries: &[LogEntry]) -> Result<Range<u64>>;

    /// Remove every entry at or after `index`
    fn truncate_suffix(&mut self, index: u64) -> Result<()>;
}

/// in-memory log for testing and embedding
///
/// stores everything on the heap, nothing survives a restart
#[derive(Debug, Default)]
pub struct MemoryLog {
    metadata: Option<LogMetadata>,
    entries: Vec<LogEntry>,
}

impl MemoryLog {
    /// create an empty in-memory log
    pub fn new() -> Self {
        Self::default()
    }

    /// create a log pre-populated with `entries`
    pub fn with_entries(entries: Vec<LogEntry>) -> Self {
        Self {
            metadata: None,
            entries,
        }
    }
}

impl RaftLog for MemoryLog {
    fn metadata(&self) -> Option<LogMetadata> {
        self.metadata
    }

    fn set_metadata(&mut self, metadata: LogMetadata) -> Result<()> {
        self.metadata = Some(metadata);
        Ok(())
    }

    fn log_size(&self) -> u64 {
        self.entries.len() as u64
    }

    fn last_log_term(&self) -> Option<Term> {
        self.entries.last().map(|entry| entry.term)
    }

    fn entry(&self, index: u64) -> Result<LogEntry> {
        self.entries
            .get(index as usize)
            .cloned()
            .ok_or(Error::OutOfRange {
                index,
                last: self.last_log_index(),
            })
    }

    fn entries(&self, start: u64, end: u64) -> Result<Vec<LogEntry>> {
        if start > end || end > self.log_size() {
            return Err(Error::InvalidRange {
                start,
                end,
                size: self.log_size(),
            });
        }
        Ok(self.entries[start as usize..end as usize].to_vec())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<Range<u64>> {
        let start = self.log_size();
        self.entries.extend(entries.iter().cloned());
        Ok(start..self.log_size())
    }

    fn truncate_suffix(&mut self, index: u64) -> Result<()> {
        self.entries.truncate(index as usize);
        Ok(())
    }
}
