//! # config
//!
//! why: collect the timing knobs of the protocol in one validated place
//! relations: read by node.rs when arming timers, embedded in raft-node's NodeConfig
//! what: RaftConfig with defaults, validation and json loading

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Protocol timing, all values in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound (inclusive) of the randomized election timeout
    pub election_timeout_max: u64,
    /// Fixed interval between leader heartbeats
    pub heartbeat_interval: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
        }
    }
}

impl RaftConfig {
    /// Reject timings under which elections could never settle
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(Error::InvalidConfig(
                "election timeout minimum must be less than maximum".to_string(),
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(Error::InvalidConfig(
                "heartbeat interval must be less than election timeout minimum".to_string(),
            ));
        }
        Ok(())
    }

    /// Load and validate a json document; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: RaftConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn random_election_timeout(&self, rng: &mut impl Rng) -> Duration {
        Duration::from_millis(rng.gen_range(self.election_timeout_min..=self.election_timeout_max))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }
}
