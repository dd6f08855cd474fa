//! # segment
//!
//! why: lay out log entries in files that can be appended, closed and rewritten safely
//! relations: used by persisted.rs for every file it touches
//! what: segment file naming, length-prefixed framing, whole-segment rewrite

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use raft_core::{Error, LogEntry, Result};

const OPEN_PREFIX: &str = "open-";
const FRAME_HEADER: usize = 4;

/// Suffix of files that are still being written and never count as data
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

/// What a file name in the log directory says about its contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentName {
    /// The append target, holding entries from `start` on
    Open { start: u64 },
    /// A full segment holding entries `start..end`
    Closed { start: u64, end: u64 },
}

impl SegmentName {
    pub(crate) fn parse(name: &str) -> Option<Self> {
        if let Some(start) = name.strip_prefix(OPEN_PREFIX) {
            return start.parse().ok().map(|start| SegmentName::Open { start });
        }
        let (start, end) = name.split_once('-')?;
        let start: u64 = start.parse().ok()?;
        let end: u64 = end.parse().ok()?;
        (start < end).then_some(SegmentName::Closed { start, end })
    }

    pub(crate) fn file_name(&self) -> String {
        match self {
            SegmentName::Open { start } => format!("{}{}", OPEN_PREFIX, start),
            SegmentName::Closed { start, end } => format!("{:020}-{:020}", start, end),
        }
    }
}

/// Length-prefixed json encoding of one entry
pub(crate) fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(entry)?;
    let len = u32::try_from(body.len())
        .map_err(|_| Error::Corrupt(format!("entry of {} bytes cannot be framed", body.len())))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Contents of one segment file
#[derive(Debug)]
pub(crate) struct SegmentContents {
    pub entries: Vec<LogEntry>,
    /// Bytes covered by complete frames
    pub valid_len: u64,
    /// Whether the file ends in an incomplete frame
    pub torn: bool,
}

/// Decode every complete frame in `path`
///
/// A frame that is complete but does not decode is corruption, not a torn write.
pub(crate) fn read_segment(path: &Path) -> Result<SegmentContents> {
    let bytes = fs::read(path)?;
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let Some(header) = bytes.get(offset..offset + FRAME_HEADER) else {
            break;
        };
        let mut len = [0u8; FRAME_HEADER];
        len.copy_from_slice(header);
        let len = u32::from_le_bytes(len) as usize;
        let body_start = offset + FRAME_HEADER;
        let Some(body) = bytes.get(body_start..body_start + len) else {
            break;
        };
        let entry = serde_json::from_slice(body).map_err(|e| {
            Error::Corrupt(format!(
                "{}: undecodable frame at byte {}: {}",
                path.display(),
                offset,
                e
            ))
        })?;
        entries.push(entry);
        offset = body_start + len;
    }

    Ok(SegmentContents {
        entries,
        valid_len: offset as u64,
        torn: offset < bytes.len(),
    })
}

/// Replace `dir/name` with exactly `entries`, atomically
///
/// Returns the size of the new file.
pub(crate) fn write_segment(dir: &Path, name: &SegmentName, entries: &[LogEntry]) -> Result<u64> {
    let path = dir.join(name.file_name());
    let temp_path = dir.join(format!("{}{}", name.file_name(), TEMP_SUFFIX));

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)?;
    let mut writer = BufWriter::new(file);
    let mut written = 0u64;
    for entry in entries {
        let frame = encode_frame(entry)?;
        writer.write_all(&frame)?;
        written += frame.len() as u64;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    fs::rename(&temp_path, &path)?;
    sync_dir(dir)?;
    Ok(written)
}

/// Open `path` for appending, creating it if needed
pub(crate) fn open_for_append(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Make renames and removals in `dir` durable
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

pub(crate) fn path_of(dir: &Path, name: &SegmentName) -> PathBuf {
    dir.join(name.file_name())
}
