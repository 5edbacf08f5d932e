#![forbid(unsafe_code)]

//! Channel and video records as they are persisted in `channels.json`.
//!
//! A channel owns its videos outright. Videos are kept newest first: the merge
//! step prepends freshly discovered uploads, so insertion order doubles as the
//! recency order shown to the user.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::status::VideoStatus;

/// Banners older than this are downloaded again on the next refresh.
pub const BANNER_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub video_id: String,
    pub title: String,
    pub thumbnail_url: String,
    #[serde(default)]
    pub upload_date: Option<NaiveDate>,
    /// Length in seconds when the listing reported one.
    #[serde(default)]
    pub duration: Option<u64>,
    pub status: VideoStatus,
    pub is_new: bool,
}

impl Video {
    pub fn new(
        video_id: impl Into<String>,
        title: impl Into<String>,
        thumbnail_url: impl Into<String>,
        duration: Option<u64>,
        status: VideoStatus,
    ) -> Self {
        Self {
            video_id: video_id.into(),
            title: title.into(),
            thumbnail_url: thumbnail_url.into(),
            upload_date: None,
            duration,
            status,
            is_new: status == VideoStatus::New,
        }
    }

    /// Keeps `is_new` in lockstep with the status.
    pub(crate) fn set_status(&mut self, status: VideoStatus) {
        self.status = status;
        self.is_new = status == VideoStatus::New;
    }

    pub fn matches_id(&self, video_id: &str) -> bool {
        self.video_id.eq_ignore_ascii_case(video_id)
    }

    /// Renders the duration as `H:MM:SS` or `M:SS` for short clips.
    pub fn duration_text(&self) -> Option<String> {
        self.duration.map(format_duration)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub channel_id: String,
    pub name: String,
    pub url: String,
    pub date_added: DateTime<Utc>,
    /// Informational only; merges never filter on it.
    #[serde(default)]
    pub monitor_from_date: Option<NaiveDate>,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    /// Remote banner image, kept so stale local copies can be re-fetched.
    #[serde(default)]
    pub banner_url: Option<String>,
    #[serde(default)]
    pub banner_path: Option<PathBuf>,
    #[serde(default)]
    pub banner_last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub videos: Vec<Video>,
}

impl Channel {
    pub fn new(
        channel_id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            name: name.into(),
            url: url.into(),
            date_added: now,
            monitor_from_date: Some(now.date_naive()),
            last_checked: None,
            banner_url: None,
            banner_path: None,
            banner_last_updated: None,
            videos: Vec::new(),
        }
    }

    pub fn find_video(&self, video_id: &str) -> Option<&Video> {
        self.videos.iter().find(|video| video.matches_id(video_id))
    }

    pub fn find_video_mut(&mut self, video_id: &str) -> Option<&mut Video> {
        self.videos.iter_mut().find(|video| video.matches_id(video_id))
    }

    pub fn contains_video(&self, video_id: &str) -> bool {
        self.find_video(video_id).is_some()
    }

    pub fn new_count(&self) -> usize {
        self.videos.iter().filter(|video| video.is_new).count()
    }

    /// The newest `cap` videos, which is what a channel page renders.
    pub fn visible_videos(&self, cap: usize) -> &[Video] {
        &self.videos[..cap.min(self.videos.len())]
    }

    pub fn banner_is_stale(&self, now: DateTime<Utc>) -> bool {
        match (&self.banner_path, self.banner_last_updated) {
            (Some(_), Some(updated)) => now - updated > TimeDelta::days(BANNER_TTL_DAYS),
            _ => true,
        }
    }
}

/// Case-folded key used wherever video ids are compared.
pub(crate) fn video_key(video_id: &str) -> String {
    video_id.to_ascii_lowercase()
}

fn format_duration(duration: u64) -> String {
    let hours = duration / 3600;
    let minutes = (duration % 3600) / 60;
    let seconds = duration % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}
