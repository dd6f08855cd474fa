//! # persisted
//!
//! why: keep the raft log and its metadata on disk so a node can crash and come back
//! relations: implements raft_core::RaftLog on top of segment.rs and metadata.rs
//! what: PersistedLog, recovery on open, append with rollover, suffix truncation
//!
//! Layout of a log directory:
//! - `metadata`: term and vote, json
//! - `{start:020}-{end:020}`: closed segments holding `start..end`, contiguous from index 0
//! - `open-<start>`: the single segment being appended to
//!
//! Every segment also keeps its entries in memory; reads never touch the disk.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::mem;
use std::ops::Range;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use raft_core::{Error, LogEntry, LogMetadata, RaftLog, Result, Term};

use crate::metadata::{MetadataFile, METADATA_FILE};
use crate::segment::{
    self, encode_frame, open_for_append, path_of, read_segment, write_segment, SegmentName,
    TEMP_SUFFIX,
};
use crate::LogOptions;

/// Entries `start..end` and the file that holds them
#[derive(Debug)]
struct Segment {
    start: u64,
    /// one past the last entry
    end: u64,
    open: bool,
    entries: Vec<LogEntry>,
    /// bytes of complete frames in the file
    byte_len: u64,
}

impl Segment {
    fn empty_open(start: u64) -> Self {
        Self {
            start,
            end: start,
            open: true,
            entries: Vec::new(),
            byte_len: 0,
        }
    }

    fn name(&self) -> SegmentName {
        if self.open {
            SegmentName::Open { start: self.start }
        } else {
            SegmentName::Closed {
                start: self.start,
                end: self.end,
            }
        }
    }

    fn file_name(&self) -> String {
        self.name().file_name()
    }

    fn entry(&self, index: u64) -> Option<&LogEntry> {
        let offset = index.checked_sub(self.start)?;
        self.entries.get(offset as usize)
    }

    /// The part of `start..end` this segment holds
    fn slice(&self, start: u64, end: u64) -> &[LogEntry] {
        let from = start.clamp(self.start, self.end) - self.start;
        let to = end.clamp(self.start, self.end) - self.start;
        &self.entries[from as usize..to as usize]
    }

    fn push(&mut self, entry: LogEntry, frame_len: u64) {
        self.entries.push(entry);
        self.end += 1;
        self.byte_len += frame_len;
    }
}

/// Durable, segmented raft log
#[derive(Debug)]
pub struct PersistedLog {
    dir: PathBuf,
    options: LogOptions,
    metadata_file: MetadataFile,
    metadata: Option<LogMetadata>,
    /// keyed by start index
    closed: BTreeMap<u64, Segment>,
    open: Segment,
    writer: BufWriter<File>,
}

impl PersistedLog {
    /// Open the log in `dir`, creating it or recovering whatever a crash left behind
    pub fn open(dir: impl AsRef<Path>, options: LogOptions) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        // start -> end of every closed segment file
        let mut closed_ranges = BTreeMap::new();
        let mut open_starts = Vec::new();
        for dir_entry in fs::read_dir(&dir)? {
            let path = dir_entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) {
                warn!("removing leftover temporary file {}", path.display());
                fs::remove_file(&path)?;
                continue;
            }
            match SegmentName::parse(name) {
                Some(SegmentName::Closed { start, end }) => {
                    closed_ranges.insert(start, end);
                }
                Some(SegmentName::Open { start }) => open_starts.push(start),
                None if name == METADATA_FILE => {}
                None => warn!("ignoring unexpected file {} in log directory", path.display()),
            }
        }

        let open_start = match open_starts.as_slice() {
            [] => None,
            [start] => Some(*start),
            starts => {
                return Err(Error::Corrupt(format!(
                    "{} open segments in {}: {:?}",
                    starts.len(),
                    dir.display(),
                    starts
                )))
            }
        };

        // an interrupted truncation leaves the rewritten open segment next to the
        // closed segments it replaces
        if let Some(open_start) = open_start {
            for (start, end) in closed_ranges.split_off(&open_start) {
                let superseded = SegmentName::Closed { start, end };
                warn!(
                    "removing closed segment {} superseded by open segment at {}",
                    superseded.file_name(),
                    open_start
                );
                fs::remove_file(path_of(&dir, &superseded))?;
            }
            segment::sync_dir(&dir)?;
        }

        let metadata_file = MetadataFile::new(&dir);
        let metadata = metadata_file.load()?;

        let mut closed = BTreeMap::new();
        let mut next_index = 0;
        for (start, end) in closed_ranges {
            let name = SegmentName::Closed { start, end };
            if start != next_index {
                return Err(Error::Corrupt(format!(
                    "closed segment {} does not start at index {}",
                    name.file_name(),
                    next_index
                )));
            }
            let contents = read_segment(&path_of(&dir, &name))?;
            if contents.torn || contents.entries.len() as u64 != end - start {
                return Err(Error::Corrupt(format!(
                    "closed segment {} holds {} entries{}",
                    name.file_name(),
                    contents.entries.len(),
                    if contents.torn { " and a torn frame" } else { "" }
                )));
            }
            closed.insert(
                start,
                Segment {
                    start,
                    end,
                    open: false,
                    entries: contents.entries,
                    byte_len: contents.valid_len,
                },
            );
            next_index = end;
        }

        let (open, writer) = match open_start {
            Some(start) => {
                if start != next_index {
                    return Err(Error::Corrupt(format!(
                        "open segment starts at {} but closed segments end at {}",
                        start, next_index
                    )));
                }
                let path = path_of(&dir, &SegmentName::Open { start });
                let contents = read_segment(&path)?;
                if contents.torn {
                    warn!(
                        "discarding torn write at the end of {} (keeping {} bytes)",
                        path.display(),
                        contents.valid_len
                    );
                    let file = fs::OpenOptions::new().write(true).open(&path)?;
                    file.set_len(contents.valid_len)?;
                    file.sync_all()?;
                }
                let open = Segment {
                    start,
                    end: start + contents.entries.len() as u64,
                    open: true,
                    entries: contents.entries,
                    byte_len: contents.valid_len,
                };
                (open, open_for_append(&path)?)
            }
            None => {
                let open = Segment::empty_open(next_index);
                let writer = open_for_append(&path_of(&dir, &open.name()))?;
                writer.get_ref().sync_all()?;
                segment::sync_dir(&dir)?;
                (open, writer)
            }
        };

        info!(
            "opened log at {} with {} entries in {} closed segment(s)",
            dir.display(),
            open.end,
            closed.len()
        );

        Ok(Self {
            dir,
            options,
            metadata_file,
            metadata,
            closed,
            open,
            writer,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of segment files, the open one included
    pub fn segment_count(&self) -> usize {
        self.closed.len() + 1
    }

    /// Segment holding `index`, if any
    fn segment_of(&self, index: u64) -> Option<&Segment> {
        if index >= self.open.start {
            return Some(&self.open);
        }
        self.closed.range(..=index).next_back().map(|(_, segment)| segment)
    }

    /// Close the open segment and start a fresh one after it
    fn roll_over(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;

        let closed_name = SegmentName::Closed {
            start: self.open.start,
            end: self.open.end,
        };
        fs::rename(
            path_of(&self.dir, &self.open.name()),
            path_of(&self.dir, &closed_name),
        )?;
        let next = Segment::empty_open(self.open.end);
        let writer = open_for_append(&path_of(&self.dir, &next.name()))?;
        segment::sync_dir(&self.dir)?;

        let mut closing = mem::replace(&mut self.open, next);
        closing.open = false;
        self.writer = writer;
        debug!(
            "closed segment {}, appending to {}",
            closing.file_name(),
            self.open.file_name()
        );
        self.closed.insert(closing.start, closing);
        Ok(())
    }

    /// Replace the open segment with one starting at `start` holding `entries`
    fn rewrite_open(&mut self, start: u64, entries: Vec<LogEntry>) -> Result<()> {
        let name = SegmentName::Open { start };
        let byte_len = write_segment(&self.dir, &name, &entries)?;
        self.writer = open_for_append(&path_of(&self.dir, &name))?;
        self.open = Segment {
            start,
            end: start + entries.len() as u64,
            open: true,
            entries,
            byte_len,
        };
        Ok(())
    }
}

impl RaftLog for PersistedLog {
    fn metadata(&self) -> Option<LogMetadata> {
        self.metadata
    }

    fn set_metadata(&mut self, metadata: LogMetadata) -> Result<()> {
        self.metadata_file.store(&metadata)?;
        self.metadata = Some(metadata);
        Ok(())
    }

    fn log_size(&self) -> u64 {
        self.open.end
    }

    fn last_log_term(&self) -> Option<Term> {
        self.open
            .entries
            .last()
            .or_else(|| {
                self.closed
                    .values()
                    .next_back()
                    .and_then(|segment| segment.entries.last())
            })
            .map(|entry| entry.term)
    }

    fn entry(&self, index: u64) -> Result<LogEntry> {
        self.segment_of(index)
            .and_then(|segment| segment.entry(index))
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
        // the segment holding `start`, then every later one beginning before `end`
        let first = self
            .closed
            .range(..=start)
            .next_back()
            .map_or(start, |(&first, _)| first);
        let mut found = Vec::with_capacity((end - start) as usize);
        for segment in self
            .closed
            .range(first..end)
            .map(|(_, segment)| segment)
            .chain([&self.open])
        {
            found.extend_from_slice(segment.slice(start, end));
        }
        Ok(found)
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<Range<u64>> {
        let start = self.log_size();
        for entry in entries {
            let frame = encode_frame(entry)?;
            let frame_len = frame.len() as u64;
            if !self.open.entries.is_empty()
                && self.open.byte_len + frame_len > self.options.max_segment_bytes
            {
                self.roll_over()?;
            }
            self.writer.write_all(&frame)?;
            self.open.push(entry.clone(), frame_len);
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(start..self.log_size())
    }

    fn truncate_suffix(&mut self, index: u64) -> Result<()> {
        if index >= self.log_size() {
            return Ok(());
        }
        debug!("truncating log at {} from index {}", self.dir.display(), index);

        if index > self.open.start {
            let start = self.open.start;
            let kept = self.open.slice(start, index).to_vec();
            self.rewrite_open(start, kept)?;
            return Ok(());
        }

        self.writer.flush()?;
        fs::remove_file(path_of(&self.dir, &self.open.name()))?;

        // highest first, so a crash part way leaves a contiguous prefix
        for discarded in self.closed.split_off(&index).into_values().rev() {
            fs::remove_file(path_of(&self.dir, &discarded.name()))?;
        }

        let straddling_start = self
            .closed
            .last_key_value()
            .filter(|(_, segment)| segment.end > index)
            .map(|(&start, _)| start);
        match straddling_start.and_then(|start| self.closed.remove(&start)) {
            Some(straddling) => {
                // new open segment first, so a crash in between is recoverable
                let kept = straddling.slice(straddling.start, index).to_vec();
                self.rewrite_open(straddling.start, kept)?;
                fs::remove_file(path_of(&self.dir, &straddling.name()))?;
            }
            None => {
                let open = Segment::empty_open(index);
                let writer = open_for_append(&path_of(&self.dir, &open.name()))?;
                writer.get_ref().sync_all()?;
                self.open = open;
                self.writer = writer;
            }
        }
        segment::sync_dir(&self.dir)
    }
}
