//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements raft-core's RaftLog; opened by raft-node for each server
//! what: PersistedLog (segmented log plus metadata record), LogOptions

mod metadata;
mod persisted;
mod segment;

use serde::{Deserialize, Serialize};

use raft_core::{Error, Result};

pub use persisted::PersistedLog;

/// Tuning for the on-disk log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// Byte budget of one segment file before a new one is started
    pub max_segment_bytes: u64,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            max_segment_bytes: 4 * 1024 * 1024,
        }
    }
}

impl LogOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_segment_bytes == 0 {
            return Err(Error::InvalidConfig(
                "max_segment_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
