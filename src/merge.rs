#![forbid(unsafe_code)]

//! Reconciles a fresh listing against what a channel already holds.
//!
//! The whole listing is always consumed, even after a known id shows up: the
//! provider's newest-first order is not strict near the boundary, and the
//! listing size is already bounded by the cap the caller chose. New videos are
//! prepended in the order they were fetched.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    history::DownloadHistory,
    listing::ListingEntry,
    model::{Channel, Video, video_key},
    status::VideoStatus,
};

/// Videos to add to a channel, computed without touching it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    pub new_videos: Vec<Video>,
    /// Fetched entries that were already stored.
    pub known_seen: usize,
    /// Entries repeated within the same listing.
    pub repeated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: Vec<String>,
    pub already_downloaded: usize,
    pub known_seen: usize,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.new_videos.is_empty()
    }
}

pub fn plan_merge(
    channel: &Channel,
    entries: &[ListingEntry],
    history: &dyn DownloadHistory,
) -> MergePlan {
    let mut known: HashSet<String> = channel
        .videos
        .iter()
        .map(|video| video_key(&video.video_id))
        .collect();
    let stored = known.len();
    let mut plan = MergePlan::default();

    for entry in entries {
        let key = video_key(&entry.id);
        if known.contains(&key) {
            if plan
                .new_videos
                .iter()
                .any(|video| video.matches_id(&entry.id))
            {
                plan.repeated += 1;
            } else {
                plan.known_seen += 1;
            }
            continue;
        }

        let status = VideoStatus::initial(history.contains(&entry.id));
        plan.new_videos.push(Video::new(
            entry.id.clone(),
            entry.title.clone(),
            entry.thumbnail_url.clone(),
            entry.duration_seconds,
            status,
        ));
        known.insert(key);
    }

    debug!(
        channel_id = %channel.channel_id,
        stored,
        fetched = entries.len(),
        new = plan.new_videos.len(),
        known_seen = plan.known_seen,
        "planned merge"
    );
    plan
}

/// Prepends the planned videos, skipping any id the channel gained since the
/// plan was computed.
pub fn apply_plan(channel: &mut Channel, plan: MergePlan) -> MergeSummary {
    let mut summary = MergeSummary {
        known_seen: plan.known_seen,
        ..MergeSummary::default()
    };
    let mut fresh: Vec<Video> = plan
        .new_videos
        .into_iter()
        .filter(|video| !channel.contains_video(&video.video_id))
        .collect();

    for video in &fresh {
        summary.added.push(video.video_id.clone());
        if video.status == VideoStatus::Downloaded {
            summary.already_downloaded += 1;
        }
    }

    fresh.append(&mut channel.videos);
    channel.videos = fresh;
    summary
}

/// Plans, applies and stamps `last_checked` in one step.
pub fn merge_into(
    channel: &mut Channel,
    entries: &[ListingEntry],
    history: &dyn DownloadHistory,
    now: DateTime<Utc>,
) -> MergeSummary {
    let plan = plan_merge(channel, entries, history);
    let summary = apply_plan(channel, plan);
    channel.last_checked = Some(now);
    summary
}
