#![forbid(unsafe_code)]

//! Channel enumeration through the external listing tool (yt-dlp).
//!
//! The tool runs in flat-playlist mode and prints one JSON object per upload,
//! newest first. Lines that fail to parse are skipped and counted. A missing
//! binary is not an error: the listing simply comes back empty with
//! [`ListingStatus::ToolUnavailable`] so the caller can move on.

use std::{future::Future, io, path::PathBuf, process::Stdio};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::url::normalize_channel_url;

/// Stderr lines kept around for diagnostics once the tool exits.
const STDERR_TAIL_LINES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub id: String,
    pub title: String,
    pub thumbnail_url: String,
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingCap {
    Unbounded,
    Latest(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingStatus {
    Completed,
    ToolUnavailable,
    /// The tool exited unsuccessfully; entries printed before that are kept.
    ToolFailed {
        code: Option<i32>,
        stderr_tail: String,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub entries: Vec<ListingEntry>,
    pub skipped_lines: usize,
    pub status: ListingStatus,
}

impl Listing {
    fn empty(status: ListingStatus) -> Self {
        Self {
            entries: Vec::new(),
            skipped_lines: 0,
            status,
        }
    }
}

/// Anything able to enumerate a channel's uploads, newest first.
pub trait ListingSource: Send + Sync {
    fn fetch(
        &self,
        channel_url: &str,
        cap: ListingCap,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Listing> + Send;
}

/// Channel metadata used when a channel is first added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub channel_id: String,
    pub name: String,
    pub url: String,
    pub banner_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct YtDlpListing {
    tool: PathBuf,
}

/// One line of `--flat-playlist --dump-json` output. Everything is optional
/// because flat entries are sparse and vary between extractor versions.
#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: Option<String>,
    title: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    id: Option<String>,
    url: Option<String>,
}

/// Subset of the `--dump-single-json` payload for a channel page.
#[derive(Debug, Deserialize)]
struct ChannelPayload {
    id: Option<String>,
    channel_id: Option<String>,
    channel: Option<String>,
    uploader: Option<String>,
    title: Option<String>,
    channel_url: Option<String>,
    uploader_url: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
}

impl YtDlpListing {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self { tool: tool.into() }
    }

    fn list_command(&self, channel_url: &str, cap: ListingCap) -> Command {
        let mut command = Command::new(&self.tool);
        command
            .arg("--flat-playlist")
            .arg("--dump-json")
            .arg("--no-warnings")
            .arg("--ignore-errors");
        if let ListingCap::Latest(limit) = cap {
            command.arg("--playlist-end").arg(limit.to_string());
        }
        command
            .arg(build_uploads_url(channel_url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Asks the tool for channel-level metadata without enumerating uploads.
    pub async fn resolve_channel(&self, channel_url: &str) -> Result<ChannelInfo> {
        let normalized = normalize_channel_url(channel_url);
        let output = Command::new(&self.tool)
            .arg("--dump-single-json")
            .arg("--flat-playlist")
            .arg("--playlist-items")
            .arg("0")
            .arg("--no-warnings")
            .arg(&normalized)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("running {} for {normalized}", self.tool.display()))?;

        if !output.status.success() {
            bail!(
                "channel lookup failed for {normalized} (status {}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let payload: ChannelPayload = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("parsing channel metadata for {normalized}"))?;
        channel_info_from_payload(payload, &normalized)
    }
}

impl ListingSource for YtDlpListing {
    async fn fetch(
        &self,
        channel_url: &str,
        cap: ListingCap,
        cancel: &CancellationToken,
    ) -> Listing {
        let mut child = match self.list_command(channel_url, cap).spawn() {
            Ok(child) => child,
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    warn!(tool = %self.tool.display(), "listing tool not found");
                } else {
                    warn!(tool = %self.tool.display(), "could not start listing tool: {err}");
                }
                return Listing::empty(ListingStatus::ToolUnavailable);
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill().await;
            return Listing::empty(ListingStatus::ToolUnavailable);
        };

        // Drained on its own task so a chatty stderr cannot stall stdout.
        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            let mut tail: Vec<String> = Vec::new();
            while let Ok(read) = reader.read_until(b'\n', &mut buf).await
                && read > 0
            {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.remove(0);
                }
                tail.push(String::from_utf8_lossy(&buf).trim_end().to_string());
                buf.clear();
            }
            tail.join("\n")
        });

        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        let mut entries = Vec::new();
        let mut skipped_lines = 0usize;
        let mut cancelled = false;
        let mut read_failed = false;

        loop {
            buf.clear();
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                read = reader.read_until(b'\n', &mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {
                    let Ok(line) = std::str::from_utf8(&buf) else {
                        skipped_lines += 1;
                        debug!(channel_url, "skipping listing line that is not UTF-8");
                        continue;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_entry_line(line) {
                        Some(entry) => entries.push(entry),
                        None => {
                            skipped_lines += 1;
                            debug!(channel_url, "skipping unparsable listing line");
                        }
                    }
                }
                Err(err) => {
                    warn!(channel_url, "listing output stopped early: {err}");
                    read_failed = true;
                    break;
                }
            }
        }

        if cancelled {
            let _ = child.kill().await;
            stderr_task.abort();
            return Listing {
                entries,
                skipped_lines,
                status: ListingStatus::Cancelled,
            };
        }

        // Nobody drains stdout anymore, so a still-running tool would block forever.
        if read_failed {
            let _ = child.kill().await;
        }

        let status = child.wait().await;
        let stderr_tail = stderr_task.await.unwrap_or_default();
        let status = match status {
            Ok(status) if status.success() => ListingStatus::Completed,
            Ok(status) => ListingStatus::ToolFailed {
                code: status.code(),
                stderr_tail,
            },
            Err(err) => ListingStatus::ToolFailed {
                code: None,
                stderr_tail: err.to_string(),
            },
        };

        Listing {
            entries,
            skipped_lines,
            status,
        }
    }
}

/// Parses one flat-playlist line; `None` for anything without a usable id.
pub fn parse_entry_line(line: &str) -> Option<ListingEntry> {
    let raw: FlatEntry = serde_json::from_str(line.trim()).ok()?;
    let id = raw.id.map(|id| id.trim().to_string())?;
    if id.is_empty() {
        return None;
    }

    let thumbnail_url = raw
        .thumbnail
        .filter(|url| !url.trim().is_empty())
        .or_else(|| raw.thumbnails.iter().rev().find_map(|thumb| thumb.url.clone()))
        .unwrap_or_else(|| default_thumbnail_url(&id));
    let title = raw
        .title
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| id.clone());
    let duration_seconds = raw
        .duration
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| secs.round() as u64);

    Some(ListingEntry {
        id,
        title,
        thumbnail_url,
        duration_seconds,
    })
}

fn default_thumbnail_url(video_id: &str) -> String {
    format!("https://i.ytimg.com/vi/{video_id}/hqdefault.jpg")
}

fn channel_info_from_payload(payload: ChannelPayload, fallback_url: &str) -> Result<ChannelInfo> {
    let channel_id = payload
        .channel_id
        .or_else(|| payload.id.filter(|id| id.starts_with("UC")))
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("no channel id reported for {fallback_url}"))?;

    let name = payload
        .channel
        .or(payload.uploader)
        .or_else(|| {
            payload
                .title
                .map(|title| title.trim_end_matches(" - Videos").to_string())
        })
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| channel_id.clone());

    let url = payload
        .channel_url
        .or(payload.uploader_url)
        .map(|url| normalize_channel_url(&url))
        .unwrap_or_else(|| fallback_url.to_string());

    let banner_url = payload
        .thumbnails
        .iter()
        .find(|thumb| thumb.id.as_deref() == Some("banner_uncropped"))
        .or_else(|| {
            payload
                .thumbnails
                .iter()
                .find(|thumb| thumb.id.as_deref().is_some_and(|id| id.contains("banner")))
        })
        .and_then(|thumb| thumb.url.clone());

    Ok(ChannelInfo {
        channel_id,
        name,
        url,
        banner_url,
    })
}

/// Points the tool at the channel's uploads tab, keeping any query or
/// fragment and never doubling the `/videos` suffix.
fn build_uploads_url(channel_url: &str) -> String {
    let (without_fragment, fragment) = match channel_url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (channel_url, None),
    };
    let (base, query) = match without_fragment.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (without_fragment, None),
    };

    let base = base.trim_end_matches('/');
    let mut result = if base.ends_with("/videos") {
        base.to_string()
    } else {
        format!("{base}/videos")
    };

    if let Some(query) = query {
        result.push('?');
        result.push_str(query);
    }
    if let Some(fragment) = fragment {
        result.push('#');
        result.push_str(fragment);
    }

    result
}
