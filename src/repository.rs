#![forbid(unsafe_code)]

//! Owner of the monitored channel collection.
//!
//! Every mutation goes through this type and ends in a full rewrite of
//! `channels.json`. A failed write is reported to the caller but never rolled
//! back: the in-memory state keeps the change, the store is flagged dirty and
//! the next successful write (or [`ChannelRepository::flush`]) catches the
//! file up.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    model::Channel,
    status::{TransitionError, VideoAction, VideoStatus},
};

const STORE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("channel {0} is already monitored")]
    AlreadyMonitored(String),
    #[error("channel {0} is not monitored")]
    ChannelNotFound(String),
    #[error("video {video_id} not found in channel {channel_id}")]
    VideoNotFound {
        channel_id: String,
        video_id: String,
    },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("could not save {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not load {}: {reason}", .path.display())]
    Load { path: PathBuf, reason: String },
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[derive(Deserialize)]
struct StoreDocument {
    version: u32,
    #[serde(default)]
    channels: Vec<Channel>,
}

/// Write-side view of [`StoreDocument`] over the live collection.
#[derive(Serialize)]
struct StoreSnapshot<'a> {
    version: u32,
    channels: &'a [Channel],
}

#[derive(Default)]
struct RepositoryState {
    channels: Vec<Channel>,
    dirty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSummary {
    pub removed: usize,
    pub kept: usize,
}

pub struct ChannelRepository {
    path: PathBuf,
    state: RwLock<RepositoryState>,
}

impl ChannelRepository {
    /// Loads the store at `path`. A missing file is an empty repository.
    pub fn open(path: &Path) -> RepositoryResult<Self> {
        let channels = if path.exists() {
            let raw = fs::read_to_string(path).map_err(|err| RepositoryError::Load {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
            let document: StoreDocument =
                serde_json::from_str(&raw).map_err(|err| RepositoryError::Load {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                })?;
            document.channels
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), channels = channels.len(), "opened channel store");

        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(RepositoryState {
                channels,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_channel(&self, channel: Channel) -> RepositoryResult<()> {
        let mut state = self.state.write();
        if state
            .channels
            .iter()
            .any(|existing| existing.channel_id == channel.channel_id)
        {
            return Err(RepositoryError::AlreadyMonitored(channel.channel_id));
        }
        state.channels.push(channel);
        self.save(&mut state)
    }

    pub fn remove_channel(&self, channel_id: &str) -> RepositoryResult<Channel> {
        let mut state = self.state.write();
        let index = position(&state.channels, channel_id)?;
        let removed = state.channels.remove(index);
        self.save(&mut state)?;
        Ok(removed)
    }

    pub fn get(&self, channel_id: &str) -> Option<Channel> {
        self.state
            .read()
            .channels
            .iter()
            .find(|channel| channel.channel_id == channel_id)
            .cloned()
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.state
            .read()
            .channels
            .iter()
            .any(|channel| channel.channel_id == channel_id)
    }

    /// Owned snapshot of every channel, in store order.
    pub fn list(&self) -> Vec<Channel> {
        self.state.read().channels.clone()
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.state
            .read()
            .channels
            .iter()
            .map(|channel| channel.channel_id.clone())
            .collect()
    }

    pub fn new_video_count(&self) -> usize {
        self.state
            .read()
            .channels
            .iter()
            .map(Channel::new_count)
            .sum()
    }

    /// Drops every video that is not ignored (ignored ones too when
    /// `include_ignored` is set) and forgets when the channel was last checked,
    /// so the next scan rediscovers the uploads from scratch.
    pub fn reset_channel(
        &self,
        channel_id: &str,
        include_ignored: bool,
    ) -> RepositoryResult<ResetSummary> {
        self.update_channel(channel_id, |channel| {
            let before = channel.videos.len();
            channel
                .videos
                .retain(|video| !include_ignored && video.status == VideoStatus::Ignored);
            channel.last_checked = None;
            ResetSummary {
                removed: before - channel.videos.len(),
                kept: channel.videos.len(),
            }
        })
    }

    /// Runs `mutate` against the stored channel and rewrites the store.
    pub fn update_channel<R>(
        &self,
        channel_id: &str,
        mutate: impl FnOnce(&mut Channel) -> R,
    ) -> RepositoryResult<R> {
        let mut state = self.state.write();
        let index = position(&state.channels, channel_id)?;
        let result = mutate(&mut state.channels[index]);
        self.save(&mut state)?;
        Ok(result)
    }

    /// Applies a user or pipeline action to one video. Illegal transitions
    /// leave the store untouched.
    pub fn apply_action(
        &self,
        channel_id: &str,
        video_id: &str,
        action: VideoAction,
    ) -> RepositoryResult<VideoStatus> {
        let mut state = self.state.write();
        let index = position(&state.channels, channel_id)?;
        let video = state.channels[index]
            .find_video_mut(video_id)
            .ok_or_else(|| RepositoryError::VideoNotFound {
                channel_id: channel_id.to_string(),
                video_id: video_id.to_string(),
            })?;
        let next = video.status.apply(action)?;
        video.set_status(next);
        self.save(&mut state)?;
        Ok(next)
    }

    pub fn record_banner(
        &self,
        channel_id: &str,
        banner_path: PathBuf,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        self.update_channel(channel_id, |channel| {
            channel.banner_path = Some(banner_path);
            channel.banner_last_updated = Some(now);
        })
    }

    /// True when the last write failed and the file lags behind memory.
    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    pub fn flush(&self) -> RepositoryResult<()> {
        let mut state = self.state.write();
        self.save(&mut state)
    }

    fn save(&self, state: &mut RepositoryState) -> RepositoryResult<()> {
        match write_store(&self.path, &state.channels) {
            Ok(()) => {
                state.dirty = false;
                Ok(())
            }
            Err(source) => {
                state.dirty = true;
                warn!(path = %self.path.display(), "channel store write failed: {source}");
                Err(RepositoryError::Persist {
                    path: self.path.clone(),
                    source,
                })
            }
        }
    }
}

fn position(channels: &[Channel], channel_id: &str) -> RepositoryResult<usize> {
    channels
        .iter()
        .position(|channel| channel.channel_id == channel_id)
        .ok_or_else(|| RepositoryError::ChannelNotFound(channel_id.to_string()))
}

/// Serializes the whole collection next to the target and renames it into
/// place so readers never observe a half-written store.
fn write_store(path: &Path, channels: &[Channel]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let document = StoreSnapshot {
        version: STORE_VERSION,
        channels,
    };
    let payload = serde_json::to_vec_pretty(&document).map_err(io::Error::other)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    io::Write::write_all(&mut tmp, &payload)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Video;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn channel_with(id: &str, statuses: &[(&str, VideoStatus)]) -> Channel {
        let mut channel = Channel::new(id, id, format!("https://www.youtube.com/@{id}"), now());
        channel.last_checked = Some(now());
        for (video_id, status) in statuses {
            channel
                .videos
                .push(Video::new(*video_id, *video_id, "", None, *status));
        }
        channel
    }

    fn open_temp() -> (tempfile::TempDir, ChannelRepository) {
        let dir = tempdir().unwrap();
        let repo = ChannelRepository::open(&dir.path().join("channels.json")).unwrap();
        (dir, repo)
    }

    #[test]
    fn add_rejects_duplicate_channel_ids() {
        let (_dir, repo) = open_temp();
        repo.add_channel(channel_with("UC1", &[])).unwrap();
        let err = repo.add_channel(channel_with("UC1", &[])).unwrap_err();
        assert!(matches!(err, RepositoryError::AlreadyMonitored(id) if id == "UC1"));
        assert_eq!(repo.list().len(), 1);
    }

    #[test]
    fn mutations_survive_reopen() {
        let (dir, repo) = open_temp();
        repo.add_channel(channel_with("UC1", &[("a", VideoStatus::New)]))
            .unwrap();
        repo.add_channel(channel_with("UC2", &[])).unwrap();
        repo.apply_action("UC1", "a", VideoAction::Snooze).unwrap();
        repo.remove_channel("UC2").unwrap();

        let reopened = ChannelRepository::open(&dir.path().join("channels.json")).unwrap();
        let channels = reopened.list();
        assert_eq!(channels.len(), 1);
        let video = channels[0].find_video("a").unwrap();
        assert_eq!(video.status, VideoStatus::Snoozed);
        assert!(!video.is_new);
    }

    #[test]
    fn updated_channel_survives_reopen() {
        let (dir, repo) = open_temp();
        repo.add_channel(channel_with("UC1", &[("a", VideoStatus::New)]))
            .unwrap();

        let added = repo
            .update_channel("UC1", |channel| {
                channel.name = "Renamed".into();
                channel.last_checked = Some(now() + chrono::TimeDelta::hours(1));
                channel.videos.insert(0, Video::new("b", "b", "", None, VideoStatus::New));
                channel.videos.len()
            })
            .unwrap();
        assert_eq!(added, 2);
        assert!(matches!(
            repo.update_channel("UC9", |_| ()),
            Err(RepositoryError::ChannelNotFound(_))
        ));

        let path = dir.path().join("channels.json");
        let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], STORE_VERSION);
        assert_eq!(raw["channels"].as_array().unwrap().len(), 1);

        let reopened = ChannelRepository::open(&path).unwrap();
        let channel = reopened.get("UC1").unwrap();
        assert_eq!(channel.name, "Renamed");
        assert_eq!(channel.last_checked, Some(now() + chrono::TimeDelta::hours(1)));
        let ids: Vec<_> = channel.videos.iter().map(|v| v.video_id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);
    }

    #[test]
    fn reset_keeps_ignored_unless_asked() {
        let (_dir, repo) = open_temp();
        repo.add_channel(channel_with(
            "UC1",
            &[
                ("a", VideoStatus::New),
                ("b", VideoStatus::New),
                ("c", VideoStatus::New),
                ("d", VideoStatus::Ignored),
            ],
        ))
        .unwrap();

        let summary = repo.reset_channel("UC1", false).unwrap();
        assert_eq!(summary, ResetSummary { removed: 3, kept: 1 });
        let channel = repo.get("UC1").unwrap();
        assert_eq!(channel.new_count(), 0);
        assert_eq!(channel.videos[0].status, VideoStatus::Ignored);
        assert!(channel.last_checked.is_none());

        let summary = repo.reset_channel("UC1", true).unwrap();
        assert_eq!(summary, ResetSummary { removed: 1, kept: 0 });
    }

    #[test]
    fn new_count_spans_all_channels() {
        let (_dir, repo) = open_temp();
        repo.add_channel(channel_with(
            "UC1",
            &[("a", VideoStatus::New), ("b", VideoStatus::Watched)],
        ))
        .unwrap();
        repo.add_channel(channel_with("UC2", &[("c", VideoStatus::New)]))
            .unwrap();
        assert_eq!(repo.new_video_count(), 2);
    }

    #[test]
    fn illegal_transition_is_rejected_without_change() {
        let (_dir, repo) = open_temp();
        repo.add_channel(channel_with("UC1", &[("a", VideoStatus::Downloaded)]))
            .unwrap();
        let err = repo
            .apply_action("UC1", "a", VideoAction::Ignore)
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Transition(_)));
        assert_eq!(
            repo.get("UC1").unwrap().videos[0].status,
            VideoStatus::Downloaded
        );
    }

    #[test]
    fn unknown_ids_are_reported() {
        let (_dir, repo) = open_temp();
        assert!(matches!(
            repo.remove_channel("nope"),
            Err(RepositoryError::ChannelNotFound(_))
        ));
        repo.add_channel(channel_with("UC1", &[])).unwrap();
        assert!(matches!(
            repo.apply_action("UC1", "missing", VideoAction::Open),
            Err(RepositoryError::VideoNotFound { .. })
        ));
    }

    #[test]
    fn list_is_a_detached_snapshot() {
        let (_dir, repo) = open_temp();
        repo.add_channel(channel_with("UC1", &[("a", VideoStatus::New)]))
            .unwrap();
        let mut snapshot = repo.list();
        snapshot[0].videos.clear();
        assert_eq!(repo.get("UC1").unwrap().videos.len(), 1);
    }

    #[test]
    fn failed_write_keeps_memory_and_marks_dirty() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "file").unwrap();
        let repo = ChannelRepository::open(&blocker.join("channels.json")).unwrap();

        let err = repo.add_channel(channel_with("UC1", &[])).unwrap_err();
        assert!(matches!(err, RepositoryError::Persist { .. }));
        assert!(repo.is_dirty());
        assert!(repo.contains("UC1"));
    }

    #[test]
    fn corrupt_store_fails_to_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("channels.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ChannelRepository::open(&path),
            Err(RepositoryError::Load { .. })
        ));
    }

    #[test]
    fn banner_is_recorded() {
        let (_dir, repo) = open_temp();
        repo.add_channel(channel_with("UC1", &[])).unwrap();
        repo.record_banner("UC1", PathBuf::from("/b/UC1.jpg"), now())
            .unwrap();
        let channel = repo.get("UC1").unwrap();
        assert_eq!(channel.banner_path, Some(PathBuf::from("/b/UC1.jpg")));
        assert!(!channel.banner_is_stale(now()));
    }
}
