#![forbid(unsafe_code)]

//! Scan orchestration: manual scans, timer-driven idle scans and the shared
//! countdown between them.
//!
//! Channels are always scanned one at a time in repository order. Within a
//! channel the listing is merged first, then publish dates are backfilled,
//! and only then is the channel written back with a fresh `lastChecked`.
//! A failure in one channel is logged and the scan moves on.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::broadcast, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::MonitorSettings,
    feed::{BackfillOutcome, FeedSource, apply_dates},
    history::DownloadHistory,
    listing::{ListingCap, ListingSource, ListingStatus},
    merge::{MergeSummary, apply_plan, plan_merge},
    model::Channel,
    repository::{ChannelRepository, RepositoryError, RepositoryResult},
    status::{VideoAction, VideoStatus},
};

const EVENT_CAPACITY: usize = 64;
const IDLE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    pub interval: Duration,
    pub idle_cap: usize,
    pub auto_scan: bool,
}

impl From<&MonitorSettings> for ScanSettings {
    fn from(settings: &MonitorSettings) -> Self {
        Self {
            interval: settings.scan_interval,
            idle_cap: settings.idle_scan_cap,
            auto_scan: settings.auto_scan,
        }
    }
}

/// Process-wide busy flags. Clones share state, so the download pipeline can
/// hold one and the scheduler sees its downloads.
#[derive(Clone, Default)]
pub struct ActivityFlags {
    inner: Arc<ActivityInner>,
}

#[derive(Default)]
struct ActivityInner {
    scanning: AtomicBool,
    downloads: AtomicUsize,
}

impl ActivityFlags {
    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    pub fn is_downloading(&self) -> bool {
        self.inner.downloads.load(Ordering::SeqCst) > 0
    }

    /// Marks a download as running until the returned guard is dropped.
    pub fn begin_download(&self) -> DownloadGuard {
        self.inner.downloads.fetch_add(1, Ordering::SeqCst);
        DownloadGuard {
            inner: self.inner.clone(),
        }
    }

    fn try_begin_scan(&self) -> Option<ScanGuard> {
        self.inner
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ScanGuard {
                inner: self.inner.clone(),
            })
    }
}

pub struct DownloadGuard {
    inner: Arc<ActivityInner>,
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        self.inner.downloads.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ScanGuard {
    inner: Arc<ActivityInner>,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.inner.scanning.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTarget {
    All,
    Channel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// User triggered, uncapped, reports per-channel progress.
    Manual,
    /// Timer driven, capped per channel, only reports start and finish.
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelScanOutcome {
    Merged {
        summary: MergeSummary,
        backfill: BackfillOutcome,
        /// The listing tool exited with an error after printing some entries.
        partial: bool,
    },
    ListingUnavailable,
    /// The listing tool failed before printing anything; the channel is left as is.
    ListingFailed {
        code: Option<i32>,
    },
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReport {
    pub channel_id: String,
    pub outcome: ChannelScanOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub mode: ScanMode,
    pub channels: Vec<ChannelReport>,
    pub cancelled: bool,
}

impl ScanReport {
    pub fn added(&self) -> usize {
        self.channels
            .iter()
            .map(|report| match &report.outcome {
                ChannelScanOutcome::Merged { summary, .. } => summary.added.len(),
                _ => 0,
            })
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Started {
        mode: ScanMode,
        channels: usize,
    },
    ChannelStarted {
        channel_id: String,
        index: usize,
        total: usize,
    },
    ChannelFinished(ChannelReport),
    /// Presentation surfaces reset their countdown display on this.
    Finished(ScanReport),
    StatusChanged {
        channel_id: String,
        video_id: String,
        status: VideoStatus,
    },
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("a scan is already running")]
    Busy,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AutoScanDisabled,
    ScanInProgress,
    DownloadInProgress,
    NotDue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleTick {
    Ran(ScanReport),
    Skipped(SkipReason),
}

pub struct ScanScheduler<L, F> {
    repo: Arc<ChannelRepository>,
    history: Arc<dyn DownloadHistory>,
    listing: L,
    feed: F,
    settings: ScanSettings,
    activity: ActivityFlags,
    last_scan_start: Mutex<Instant>,
    current_cancel: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<ScanEvent>,
}

impl<L: ListingSource, F: FeedSource> ScanScheduler<L, F> {
    pub fn new(
        repo: Arc<ChannelRepository>,
        history: Arc<dyn DownloadHistory>,
        listing: L,
        feed: F,
        settings: ScanSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            repo,
            history,
            listing,
            feed,
            settings,
            activity: ActivityFlags::default(),
            last_scan_start: Mutex::new(Instant::now()),
            current_cancel: Mutex::new(None),
            events,
        }
    }

    pub fn repository(&self) -> &Arc<ChannelRepository> {
        &self.repo
    }

    pub fn activity(&self) -> ActivityFlags {
        self.activity.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    pub fn last_scan_started(&self) -> Instant {
        *self.last_scan_start.lock()
    }

    /// Seconds left before the next idle scan is due, never negative.
    pub fn seconds_until_next_scan(&self) -> u64 {
        self.settings
            .interval
            .saturating_sub(self.last_scan_started().elapsed())
            .as_secs()
    }

    /// Asks the running scan, if any, to stop. Channels already merged keep
    /// their results.
    pub fn cancel_scan(&self) {
        if let Some(token) = self.current_cancel.lock().as_ref() {
            token.cancel();
        }
    }

    pub async fn manual_scan(&self, target: ScanTarget) -> Result<ScanReport, ScanError> {
        self.run_scan(target, ScanMode::Manual).await
    }

    /// One timer tick. Does nothing unless auto-scan is on, nothing else is
    /// busy and the countdown has run out.
    pub async fn idle_tick(&self) -> IdleTick {
        if !self.settings.auto_scan {
            return IdleTick::Skipped(SkipReason::AutoScanDisabled);
        }
        if self.activity.is_scanning() {
            return IdleTick::Skipped(SkipReason::ScanInProgress);
        }
        if self.activity.is_downloading() {
            return IdleTick::Skipped(SkipReason::DownloadInProgress);
        }
        if self.seconds_until_next_scan() > 0 {
            return IdleTick::Skipped(SkipReason::NotDue);
        }

        match self.run_scan(ScanTarget::All, ScanMode::Idle).await {
            Ok(report) => IdleTick::Ran(report),
            Err(ScanError::Busy) => IdleTick::Skipped(SkipReason::ScanInProgress),
            Err(err) => {
                warn!("idle scan could not start: {err}");
                IdleTick::Skipped(SkipReason::ScanInProgress)
            }
        }
    }

    /// Polls once per second until `shutdown` fires. A scan in flight at
    /// shutdown is cancelled and awaited.
    pub async fn run_idle_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(IDLE_POLL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let tick = self.idle_tick();
            tokio::pin!(tick);
            let finished = tokio::select! {
                outcome = &mut tick => Some(outcome),
                _ = shutdown.cancelled() => None,
            };
            let outcome = match finished {
                Some(outcome) => outcome,
                None => {
                    self.cancel_scan();
                    tick.await
                }
            };

            match outcome {
                IdleTick::Ran(report) => info!(
                    channels = report.channels.len(),
                    added = report.added(),
                    cancelled = report.cancelled,
                    "idle scan finished"
                ),
                IdleTick::Skipped(SkipReason::NotDue) => {}
                IdleTick::Skipped(reason) => debug!(?reason, "idle tick skipped"),
            }
        }
    }

    /// Applies a per-video action and notifies subscribers.
    pub fn set_status(
        &self,
        channel_id: &str,
        video_id: &str,
        action: VideoAction,
    ) -> RepositoryResult<VideoStatus> {
        let status = self.repo.apply_action(channel_id, video_id, action)?;
        self.emit(ScanEvent::StatusChanged {
            channel_id: channel_id.to_string(),
            video_id: video_id.to_string(),
            status,
        });
        Ok(status)
    }

    async fn run_scan(&self, target: ScanTarget, mode: ScanMode) -> Result<ScanReport, ScanError> {
        let Some(_guard) = self.activity.try_begin_scan() else {
            return Err(ScanError::Busy);
        };

        let channels = match target {
            ScanTarget::All => self.repo.list(),
            ScanTarget::Channel(channel_id) => vec![
                self.repo
                    .get(&channel_id)
                    .ok_or(RepositoryError::ChannelNotFound(channel_id))?,
            ],
        };

        let cancel = CancellationToken::new();
        *self.current_cancel.lock() = Some(cancel.clone());
        *self.last_scan_start.lock() = Instant::now();
        self.history.refresh();

        let total = channels.len();
        info!(?mode, channels = total, "scan started");
        self.emit(ScanEvent::Started {
            mode,
            channels: total,
        });

        let mut report = ScanReport {
            mode,
            channels: Vec::with_capacity(total),
            cancelled: false,
        };

        for (index, channel) in channels.into_iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let channel_id = channel.channel_id.clone();
            if mode == ScanMode::Manual {
                self.emit(ScanEvent::ChannelStarted {
                    channel_id: channel_id.clone(),
                    index,
                    total,
                });
            }

            let outcome = self.scan_channel(channel, mode, &cancel).await;
            let cancelled = outcome == ChannelScanOutcome::Cancelled;
            let channel_report = ChannelReport {
                channel_id,
                outcome,
            };
            if mode == ScanMode::Manual {
                self.emit(ScanEvent::ChannelFinished(channel_report.clone()));
            }
            report.channels.push(channel_report);

            if cancelled {
                report.cancelled = true;
                break;
            }
        }

        *self.current_cancel.lock() = None;
        info!(
            ?mode,
            added = report.added(),
            cancelled = report.cancelled,
            "scan finished"
        );
        self.emit(ScanEvent::Finished(report.clone()));
        Ok(report)
    }

    async fn scan_channel(
        &self,
        channel: Channel,
        mode: ScanMode,
        cancel: &CancellationToken,
    ) -> ChannelScanOutcome {
        let channel_id = channel.channel_id.as_str();
        let cap = match mode {
            ScanMode::Manual => ListingCap::Unbounded,
            ScanMode::Idle => ListingCap::Latest(self.settings.idle_cap),
        };

        let listing = self.listing.fetch(&channel.url, cap, cancel).await;
        if listing.skipped_lines > 0 {
            debug!(channel_id, skipped = listing.skipped_lines, "listing had unparsable lines");
        }
        let partial = match &listing.status {
            ListingStatus::Completed => false,
            ListingStatus::Cancelled => {
                info!(channel_id, "scan cancelled while listing");
                return ChannelScanOutcome::Cancelled;
            }
            ListingStatus::ToolUnavailable => {
                warn!(channel_id, "listing tool unavailable, skipping channel");
                return ChannelScanOutcome::ListingUnavailable;
            }
            ListingStatus::ToolFailed { code, stderr_tail } if listing.entries.is_empty() => {
                warn!(channel_id, ?code, "listing tool failed: {stderr_tail}");
                return ChannelScanOutcome::ListingFailed { code: *code };
            }
            ListingStatus::ToolFailed { code, stderr_tail } => {
                warn!(
                    channel_id,
                    ?code,
                    entries = listing.entries.len(),
                    "listing tool failed: {stderr_tail}"
                );
                true
            }
        };

        let plan = plan_merge(&channel, &listing.entries, self.history.as_ref());
        let feed = if !plan.is_empty() || mode == ScanMode::Manual {
            Some(self.feed.fetch_entries(channel_id).await)
        } else {
            None
        };

        let now = Utc::now();
        let result = self.repo.update_channel(channel_id, |stored| {
            let summary = apply_plan(stored, plan);
            let backfill = match feed {
                None => BackfillOutcome::Skipped,
                Some(Ok(entries)) => BackfillOutcome::Applied {
                    feed_entries: entries.len(),
                    filled: apply_dates(stored, &entries),
                },
                Some(Err(err)) => BackfillOutcome::Failed(err),
            };
            stored.last_checked = Some(now);
            (summary, backfill)
        });

        match result {
            Ok((summary, backfill)) => {
                if let BackfillOutcome::Failed(err) = &backfill {
                    warn!(channel_id, "date backfill failed: {err}");
                }
                info!(
                    channel_id,
                    added = summary.added.len(),
                    already_downloaded = summary.already_downloaded,
                    "channel merged"
                );
                ChannelScanOutcome::Merged {
                    summary,
                    backfill,
                    partial,
                }
            }
            Err(err) => {
                warn!(channel_id, "could not store scan results: {err}");
                ChannelScanOutcome::Failed(err.to_string())
            }
        }
    }

    fn emit(&self, event: ScanEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
