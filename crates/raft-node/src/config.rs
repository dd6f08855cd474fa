//! # config
//!
//! why: describe one server of the cluster in a single loadable document
//! relations: consumed by server.rs when spawning a node
//! what: NodeConfig

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use raft_core::{NodeId, RaftConfig, Result};
use raft_storage::LogOptions;

/// Everything needed to start one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    /// Directory holding this server's log segments and metadata
    pub data_dir: PathBuf,
    #[serde(default)]
    pub raft: RaftConfig,
    #[serde(default)]
    pub log: LogOptions,
}

impl NodeConfig {
    pub fn new(id: NodeId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            data_dir: data_dir.into(),
            raft: RaftConfig::default(),
            log: LogOptions::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.raft.validate()?;
        self.log.validate()
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }
}
