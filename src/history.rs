#![forbid(unsafe_code)]

//! Read-only view of what the download pipeline has already fetched.
//!
//! The merge step consults this to decide whether a newly discovered video
//! starts out as `New` or as `Downloaded`.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::model::video_key;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub video_id: String,
    pub recorded_at: Option<DateTime<Utc>>,
}

pub trait DownloadHistory: Send + Sync {
    fn lookup(&self, video_id: &str) -> Option<HistoryEntry>;

    fn contains(&self, video_id: &str) -> bool {
        self.lookup(video_id).is_some()
    }

    /// Called once before each scan so long-lived processes see new downloads.
    fn refresh(&self) {}
}

/// History backed by the downloader's archive file (`youtube <id>` per line).
///
/// The archive carries no per-line timestamps, so every entry reports the
/// file's modification time as its `recorded_at`.
pub struct ArchiveHistory {
    path: PathBuf,
    state: RwLock<ArchiveState>,
}

#[derive(Default)]
struct ArchiveState {
    entries: HashMap<String, String>,
    modified: Option<SystemTime>,
}

impl ArchiveHistory {
    pub fn open(path: &Path) -> Result<Self> {
        let history = Self {
            path: path.to_path_buf(),
            state: RwLock::new(ArchiveState::default()),
        };
        *history.state.write() = load_archive(path)?;
        Ok(history)
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DownloadHistory for ArchiveHistory {
    fn lookup(&self, video_id: &str) -> Option<HistoryEntry> {
        let state = self.state.read();
        state
            .entries
            .get(&video_key(video_id))
            .map(|original| HistoryEntry {
                video_id: original.clone(),
                recorded_at: state.modified.map(DateTime::<Utc>::from),
            })
    }

    fn refresh(&self) {
        let current = fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok();
        if current == self.state.read().modified {
            return;
        }
        match load_archive(&self.path) {
            Ok(state) => {
                debug!(
                    path = %self.path.display(),
                    entries = state.entries.len(),
                    "reloaded download archive"
                );
                *self.state.write() = state;
            }
            Err(err) => {
                warn!(path = %self.path.display(), "could not reload download archive: {err:#}");
            }
        }
    }
}

/// Parses the archive, keeping the last whitespace-separated token of each
/// line as the video id. A missing archive is an empty history.
fn load_archive(path: &Path) -> Result<ArchiveState> {
    if !path.exists() {
        return Ok(ArchiveState::default());
    }

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let modified = file.metadata().and_then(|meta| meta.modified()).ok();
    let reader = BufReader::new(file);
    let mut entries = HashMap::new();

    for line in reader.lines() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if let Some(id) = line.split_whitespace().last()
            && !id.is_empty()
        {
            entries.insert(video_key(id), id.to_owned());
        }
    }

    Ok(ArchiveState { entries, modified })
}

/// In-memory history, handy for embedding and tests.
#[derive(Default)]
pub struct MemoryHistory {
    entries: RwLock<HashMap<String, HistoryEntry>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let history = Self::new();
        for id in ids {
            history.record(id, None);
        }
        history
    }

    pub fn record(&self, video_id: impl Into<String>, recorded_at: Option<DateTime<Utc>>) {
        let video_id = video_id.into();
        self.entries.write().insert(
            video_key(&video_id),
            HistoryEntry {
                video_id,
                recorded_at,
            },
        );
    }
}

impl DownloadHistory for MemoryHistory {
    fn lookup(&self, video_id: &str) -> Option<HistoryEntry> {
        self.entries.read().get(&video_key(video_id)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn archive_lines_are_indexed_by_last_token() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("download-archive.txt");
        fs::write(&path, "youtube abc123\nyoutube def456\n\nyoutube abc123\n")?;

        let history = ArchiveHistory::open(&path)?;
        assert_eq!(history.len(), 2);
        let entry = history.lookup("abc123").expect("entry present");
        assert_eq!(entry.video_id, "abc123");
        assert!(entry.recorded_at.is_some());
        assert!(history.contains("DEF456"));
        assert!(!history.contains("zzz"));
        Ok(())
    }

    #[test]
    fn missing_archive_is_empty() -> Result<()> {
        let dir = tempdir()?;
        let history = ArchiveHistory::open(&dir.path().join("nope.txt"))?;
        assert!(history.is_empty());
        assert!(history.lookup("abc").is_none());
        Ok(())
    }

    #[test]
    fn refresh_picks_up_new_downloads() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("archive.txt");
        let history = ArchiveHistory::open(&path)?;
        assert!(!history.contains("late"));

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "youtube late")?;
        drop(file);

        history.refresh();
        assert!(history.contains("late"));
        Ok(())
    }

    #[test]
    fn memory_history_keeps_timestamps() {
        let when = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let history = MemoryHistory::with_ids(["a"]);
        history.record("B", Some(when));
        assert!(history.contains("a"));
        assert_eq!(history.lookup("b").unwrap().recorded_at, Some(when));
    }
}
