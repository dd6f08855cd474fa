//! # metadata
//!
//! why: persist term and vote so a restarted node never votes twice in a term
//! relations: owned by persisted.rs, lives next to the segment files
//! what: MetadataFile with atomic temp-then-rename writes

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use raft_core::{LogMetadata, Result};

use crate::segment::{sync_dir, TEMP_SUFFIX};

pub(crate) const METADATA_FILE: &str = "metadata";

/// The `metadata` file of a log directory
#[derive(Debug)]
pub(crate) struct MetadataFile {
    dir: PathBuf,
}

impl MetadataFile {
    pub(crate) fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// `None` for a directory that never stored metadata
    pub(crate) fn load(&self) -> Result<Option<LogMetadata>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&contents)?))
    }

    pub(crate) fn store(&self, metadata: &LogMetadata) -> Result<()> {
        let json = serde_json::to_vec(metadata)?;

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join(format!("{}{}", METADATA_FILE, TEMP_SUFFIX));
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.path())?;
        sync_dir(&self.dir)
    }
}
