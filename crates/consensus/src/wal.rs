//! Write-ahead log
//!
//! One JSON record per line, `{"time": .., "msg": {"type": .., "data": ..}}`.
//! A `#HEIGHT: <h>` line precedes the NewHeight step record of every height
//! and marks where replay of that height starts. Every write is flushed
//! before returning; a failed write is fatal.
//!
//! Records go to the head file `wal`. Once the head passes its size limit it
//! is rotated to `wal.NNNNNN` right before the next height marker, so a
//! height never spans two files. Rotated segments are pruned oldest first
//! when the group grows past its total limit.

use crate::error::WalError;
use crate::fatal;
use crate::messages::MsgInfo;
use crate::round_state::{RoundStateEvent, RoundStep};
use crate::ticker::TimeoutInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const WAL_FILE_NAME: &str = "wal";

/// Head size that triggers rotation at the next height (10MB)
pub const WAL_HEAD_SIZE_LIMIT: u64 = 10 * 1024 * 1024;

/// Size of the head plus all segments before the oldest are removed (1GB)
pub const WAL_TOTAL_SIZE_LIMIT: u64 = 1024 * 1024 * 1024;

const HEIGHT_PREFIX: &str = "#HEIGHT: ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WalMessage {
    RoundState(RoundStateEvent),
    MsgInfo(MsgInfo),
    Timeout(TimeoutInfo),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedWalMessage {
    pub time: DateTime<Utc>,
    pub msg: WalMessage,
}

fn height_line(height: i64) -> String {
    format!("{}{}", HEIGHT_PREFIX, height)
}

fn parse_height_line(line: &str) -> Option<i64> {
    line.strip_prefix(HEIGHT_PREFIX)?.trim().parse().ok()
}

pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    head_size: u64,
    head_size_limit: u64,
    total_size_limit: u64,
    /// Skip messages received from peers
    light: bool,
}

impl Wal {
    /// Open `<dir>/wal` for appending with the default size limits
    pub fn open(dir: impl AsRef<Path>, light: bool) -> Result<Self, WalError> {
        Self::open_with_limits(dir, light, WAL_HEAD_SIZE_LIMIT, WAL_TOTAL_SIZE_LIMIT)
    }

    /// Open `<dir>/wal` for appending, creating it if needed.
    /// A new log starts with the marker for height 1.
    pub fn open_with_limits(
        dir: impl AsRef<Path>,
        light: bool,
        head_size_limit: u64,
        total_size_limit: u64,
    ) -> Result<Self, WalError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(WAL_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let head_size = file.metadata()?.len();

        let mut wal = Self {
            path,
            writer: BufWriter::new(file),
            head_size,
            head_size_limit,
            total_size_limit,
            light,
        };
        if head_size == 0 && segments(&wal.path)?.is_empty() {
            wal.write_line(&height_line(1))?;
        }
        tracing::info!("Opened WAL at {}", wal.path.display());
        Ok(wal)
    }

    /// Path of the head file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record. Panics if it cannot be written.
    pub fn save(&mut self, msg: WalMessage) {
        if let Err(e) = self.try_save(msg) {
            fatal!("Error writing to consensus WAL {}: {}", self.path.display(), e);
        }
    }

    fn try_save(&mut self, msg: WalMessage) -> Result<(), WalError> {
        if self.light {
            if let WalMessage::MsgInfo(mi) = &msg {
                if !mi.is_internal() {
                    return Ok(());
                }
            }
        }

        if let WalMessage::RoundState(rs) = &msg {
            if rs.step == RoundStep::NewHeight {
                if self.head_size >= self.head_size_limit {
                    self.rotate()?;
                }
                self.write_line(&height_line(rs.height))?;
            }
        }

        let record = TimedWalMessage { time: Utc::now(), msg };
        let line = serde_json::to_string(&record)?;
        self.write_line(&line)
    }

    fn write_line(&mut self, line: &str) -> Result<(), WalError> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.head_size += line.len() as u64 + 1;
        Ok(())
    }

    /// Move the head to the next segment index and start an empty head
    fn rotate(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        let index = segments(&self.path)?.last().map(|(i, _)| i + 1).unwrap_or(0);
        let rotated = segment_path(&self.path, index);
        fs::rename(&self.path, &rotated)?;

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.head_size = 0;
        tracing::info!("Rotated WAL head to {}", rotated.display());
        self.prune()
    }

    fn prune(&self) -> Result<(), WalError> {
        let mut sized = Vec::new();
        let mut total = self.head_size;
        for (_, seg) in segments(&self.path)? {
            let len = fs::metadata(&seg)?.len();
            total += len;
            sized.push((seg, len));
        }
        for (seg, len) in sized {
            if total <= self.total_size_limit {
                break;
            }
            fs::remove_file(&seg)?;
            total -= len;
            tracing::info!("Removed WAL segment {}", seg.display());
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::error!("Failed to flush WAL on stop: {}", e);
        }
        tracing::info!("Stopped WAL at {}", self.path.display());
    }
}

fn head_name(head: &Path) -> String {
    head.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| WAL_FILE_NAME.to_string())
}

fn segment_path(head: &Path, index: u64) -> PathBuf {
    head.with_file_name(format!("{}.{:06}", head_name(head), index))
}

/// Rotated segments next to `head`, oldest first
pub fn segments(head: &Path) -> Result<Vec<(u64, PathBuf)>, WalError> {
    let dir = match head.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let prefix = format!("{}.", head_name(head));
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let index = name
            .to_string_lossy()
            .strip_prefix(&prefix)
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(index) = index {
            found.push((index, entry.path()));
        }
    }
    found.sort();
    Ok(found)
}

enum Scan {
    Found(Vec<String>),
    /// Every marker in the file is above the height
    Above,
    /// The file starts below the height, so older files cannot hold it
    Below,
}

fn scan_file(path: &Path, marker: &str, height: i64) -> Result<Scan, WalError> {
    let file = File::open(path)?;
    let mut first = None;
    let mut found = false;
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if found {
            lines.push(line);
            continue;
        }
        if line == marker {
            found = true;
        } else if first.is_none() {
            first = parse_height_line(&line);
        }
    }
    Ok(match (found, first) {
        (true, _) => Scan::Found(lines),
        (false, Some(h)) if h < height => Scan::Below,
        _ => Scan::Above,
    })
}

/// Lines written after the marker for `height`, or None without a marker.
/// Searches the head first, then segments newest first.
pub fn lines_after_height(path: &Path, height: i64) -> Result<Option<Vec<String>>, WalError> {
    match fs::metadata(path) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let marker = height_line(height);
    let mut files = vec![path.to_path_buf()];
    files.extend(segments(path)?.into_iter().rev().map(|(_, p)| p));
    for file in files {
        match scan_file(&file, &marker, height)? {
            Scan::Found(lines) => return Ok(Some(lines)),
            Scan::Below => return Ok(None),
            Scan::Above => {}
        }
    }
    Ok(None)
}

pub fn contains_height(path: &Path, height: i64) -> Result<bool, WalError> {
    Ok(lines_after_height(path, height)?.is_some())
}

/// Decode one record line. Returns None for markers and blank lines.
pub fn decode_line(line: &str) -> Result<Option<TimedWalMessage>, WalError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::StateMessage;
    use crate::tests::support::{block_id, signed_vote, signers, validator_set};
    use crate::types::VoteType;
    use std::time::Duration;

    fn vote_msg(peer: &str) -> WalMessage {
        let keys = signers(1);
        let set = validator_set(&keys, 1);
        let vote = signed_vote(&keys[0], &set, 1, 0, VoteType::Prevote, block_id(1));
        WalMessage::MsgInfo(MsgInfo::new(StateMessage::Vote(vote), peer))
    }

    fn step(height: i64, step: RoundStep) -> WalMessage {
        WalMessage::RoundState(RoundStateEvent { height, round: 0, step })
    }

    fn records(path: &Path, height: i64) -> Vec<WalMessage> {
        lines_after_height(path, height)
            .unwrap()
            .unwrap()
            .iter()
            .filter_map(|l| decode_line(l).unwrap())
            .map(|r| r.msg)
            .collect()
    }

    #[test]
    fn test_new_wal_starts_at_height_one() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path(), false).unwrap();
        assert!(contains_height(wal.path(), 1).unwrap());
        assert!(!contains_height(wal.path(), 2).unwrap());
        assert!(records(wal.path(), 1).is_empty());
    }

    #[test]
    fn test_records_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path(), false).unwrap();
        let timeout = WalMessage::Timeout(TimeoutInfo::new(Duration::from_millis(30), 1, 0, RoundStep::Propose));
        wal.save(step(1, RoundStep::Propose));
        wal.save(vote_msg("peer"));
        wal.save(timeout.clone());

        let got = records(wal.path(), 1);
        assert_eq!(got, vec![step(1, RoundStep::Propose), vote_msg("peer"), timeout]);
    }

    #[test]
    fn test_new_height_writes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path(), false).unwrap();
        wal.save(vote_msg(""));
        wal.save(step(2, RoundStep::NewHeight));
        wal.save(vote_msg("peer"));

        assert_eq!(records(wal.path(), 2), vec![step(2, RoundStep::NewHeight), vote_msg("peer")]);
        assert_eq!(records(wal.path(), 1).len(), 3);
    }

    #[test]
    fn test_light_mode_skips_peer_messages() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path(), true).unwrap();
        wal.save(vote_msg("peer"));
        wal.save(vote_msg(""));
        wal.save(step(1, RoundStep::Prevote));

        assert_eq!(records(wal.path(), 1), vec![vote_msg(""), step(1, RoundStep::Prevote)]);
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut wal = Wal::open(dir.path(), false).unwrap();
            wal.save(step(1, RoundStep::Propose));
            wal.stop();
        }
        let mut wal = Wal::open(dir.path(), false).unwrap();
        wal.save(step(1, RoundStep::Prevote));
        assert_eq!(records(wal.path(), 1), vec![step(1, RoundStep::Propose), step(1, RoundStep::Prevote)]);
    }

    #[test]
    fn test_decode_skips_markers_and_rejects_garbage() {
        assert!(decode_line("#HEIGHT: 4").unwrap().is_none());
        assert!(decode_line("   ").unwrap().is_none());
        assert!(matches!(decode_line("{not json"), Err(WalError::Json(_))));
    }

    #[test]
    fn test_full_head_rotates_at_next_height() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open_with_limits(dir.path(), false, 1, u64::MAX).unwrap();
        wal.save(step(1, RoundStep::Propose));
        wal.save(step(2, RoundStep::NewHeight));
        wal.save(vote_msg("peer"));

        let segs = segments(wal.path()).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].1, dir.path().join("wal.000000"));

        // each height lives in one file
        assert_eq!(records(wal.path(), 1), vec![step(1, RoundStep::Propose)]);
        assert_eq!(records(wal.path(), 2), vec![step(2, RoundStep::NewHeight), vote_msg("peer")]);
        assert!(!contains_height(wal.path(), 3).unwrap());

        // reopening keeps appending to the rotated head
        drop(wal);
        let mut wal = Wal::open_with_limits(dir.path(), false, 1, u64::MAX).unwrap();
        wal.save(step(2, RoundStep::Prevote));
        assert_eq!(records(wal.path(), 2).len(), 3);
        assert!(!std::fs::read_to_string(wal.path()).unwrap().contains("#HEIGHT: 1"));
    }

    #[test]
    fn test_old_segments_pruned_past_total_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open_with_limits(dir.path(), false, 1, 1).unwrap();
        for height in 2..=4 {
            wal.save(step(height, RoundStep::NewHeight));
            wal.save(vote_msg("peer"));
        }

        assert!(segments(wal.path()).unwrap().is_empty());
        assert!(!contains_height(wal.path(), 1).unwrap());
        assert_eq!(records(wal.path(), 4), vec![step(4, RoundStep::NewHeight), vote_msg("peer")]);
    }
}
