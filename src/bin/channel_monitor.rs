#![forbid(unsafe_code)]

//! Command-line front end for the channel monitor.
//!
//! Every subcommand loads the same settings, opens the channel store under
//! `MONITOR_ROOT` and exits. `watch` keeps running the idle scan loop until
//! Ctrl+C.

use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use newtube_monitor::{
    banner::{BannerCache, BannerRefresh},
    config::{MonitorSettings, SettingsOverrides, parse_flag, resolve_settings},
    feed::{BackfillOutcome, HttpFeed},
    history::ArchiveHistory,
    listing::YtDlpListing,
    model::Channel,
    repository::ChannelRepository,
    scheduler::{ChannelScanOutcome, ScanEvent, ScanReport, ScanScheduler, ScanSettings, ScanTarget},
    status::VideoAction,
    url::{is_valid_channel_url, normalize_channel_url},
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Scheduler = ScanScheduler<YtDlpListing, HttpFeed>;

#[derive(Parser)]
#[command(name = "channel_monitor", version, about = "Watch YouTube channels for new uploads")]
struct Cli {
    /// Directory holding channels.json, banners and the download archive.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Settings file to read before the environment.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start monitoring a channel by handle or URL.
    Add {
        url: String,
        /// Skip the first scan of the new channel.
        #[arg(long)]
        no_scan: bool,
    },
    /// Stop monitoring a channel.
    Remove { channel_id: String },
    /// List monitored channels.
    List,
    /// Show a channel's videos, newest first.
    Videos {
        channel_id: String,
        /// Ignore DISPLAY_CAP and print everything.
        #[arg(long)]
        all: bool,
    },
    /// Forget a channel's videos so the next scan finds them again.
    Reset {
        channel_id: String,
        #[arg(long)]
        include_ignored: bool,
    },
    /// Scan one channel, or all of them, without a cap. Ctrl+C cancels.
    Scan { channel_id: Option<String> },
    /// Run idle scans on the configured interval until Ctrl+C.
    Watch {
        #[arg(long)]
        interval_minutes: Option<u64>,
        #[arg(long, value_parser = parse_switch)]
        auto_scan: Option<bool>,
    },
    /// Apply snooze, unsnooze, open, ignore, wake or downloaded to a video.
    Status {
        channel_id: String,
        video_id: String,
        action: String,
    },
    /// Print how many videos are still new across all channels.
    NewCount,
    /// Re-download banners older than a week, looking up missing banner URLs.
    RefreshBanners,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut overrides = SettingsOverrides {
        root: cli.root,
        env_path: cli.env_file,
        ..SettingsOverrides::default()
    };
    if let Command::Watch {
        interval_minutes,
        auto_scan,
    } = &cli.command
    {
        overrides.scan_interval_minutes = *interval_minutes;
        overrides.auto_scan = *auto_scan;
    }

    let settings = resolve_settings(overrides).context("loading settings")?;
    let repo = Arc::new(
        ChannelRepository::open(&settings.store_path).context("opening channel store")?,
    );

    match cli.command {
        Command::Add { url, no_scan } => add_channel(&settings, repo, &url, no_scan).await,
        Command::Remove { channel_id } => {
            let removed = repo.remove_channel(&channel_id)?;
            if let Some(banner) = &removed.banner_path
                && let Err(err) = fs::remove_file(banner)
            {
                warn!(path = %banner.display(), "could not delete banner: {err}");
            }
            println!("Removed {} ({})", removed.name, removed.channel_id);
            Ok(())
        }
        Command::List => {
            list_channels(&repo);
            Ok(())
        }
        Command::Videos { channel_id, all } => {
            let channel = repo
                .get(&channel_id)
                .ok_or_else(|| anyhow!("channel {channel_id} is not monitored"))?;
            let cap = if all {
                channel.videos.len()
            } else {
                settings.display_cap
            };
            print_videos(&channel, cap);
            Ok(())
        }
        Command::Reset {
            channel_id,
            include_ignored,
        } => {
            let summary = repo.reset_channel(&channel_id, include_ignored)?;
            println!(
                "Reset {channel_id}: removed {} video(s), kept {}",
                summary.removed, summary.kept
            );
            Ok(())
        }
        Command::Scan { channel_id } => {
            let scheduler = build_scheduler(&settings, repo)?;
            let target = channel_id.map_or(ScanTarget::All, ScanTarget::Channel);
            let report = scan_until_interrupted(&scheduler, target).await?;
            print_report(&report);
            if !report.cancelled {
                refresh_banners(&settings, scheduler.repository(), false).await;
            }
            Ok(())
        }
        Command::Watch { .. } => watch(&settings, repo).await,
        Command::Status {
            channel_id,
            video_id,
            action,
        } => {
            let action = VideoAction::parse(&action)
                .ok_or_else(|| anyhow!("unknown action {action:?}"))?;
            let status = repo.apply_action(&channel_id, &video_id, action)?;
            println!("{video_id} is now {status}");
            Ok(())
        }
        Command::NewCount => {
            println!("{}", repo.new_video_count());
            Ok(())
        }
        Command::RefreshBanners => {
            refresh_banners(&settings, &repo, true).await;
            Ok(())
        }
    }
}

fn parse_switch(value: &str) -> Result<bool, String> {
    parse_flag(value).ok_or_else(|| format!("expected a yes/no value, got {value:?}"))
}

fn build_scheduler(settings: &MonitorSettings, repo: Arc<ChannelRepository>) -> Result<Scheduler> {
    let history = ArchiveHistory::open(&settings.archive_path)
        .with_context(|| format!("reading {}", settings.archive_path.display()))?;
    Ok(ScanScheduler::new(
        repo,
        Arc::new(history),
        YtDlpListing::new(settings.listing_tool.clone()),
        HttpFeed::new(settings.feed_timeout),
        ScanSettings::from(settings),
    ))
}

async fn add_channel(
    settings: &MonitorSettings,
    repo: Arc<ChannelRepository>,
    input: &str,
    no_scan: bool,
) -> Result<()> {
    let url = normalize_channel_url(input);
    if !is_valid_channel_url(&url) {
        bail!("{input:?} does not look like a channel URL or @handle");
    }

    let listing = YtDlpListing::new(settings.listing_tool.clone());
    let info = listing.resolve_channel(&url).await?;
    let now = Utc::now();
    let mut channel = Channel::new(info.channel_id, info.name, info.url, now);
    channel.banner_url = info.banner_url.clone();
    repo.add_channel(channel.clone())?;
    println!("Added {} ({})", channel.name, channel.channel_id);

    if let Some(banner_url) = info.banner_url.as_deref() {
        let cache = BannerCache::new(settings.banner_dir.clone());
        if let Err(err) = cache.refresh(&repo, &channel, banner_url, now).await {
            warn!(channel_id = %channel.channel_id, "banner download failed: {err:#}");
        }
    }

    if no_scan {
        return Ok(());
    }
    let scheduler = build_scheduler(settings, repo)?;
    let report =
        scan_until_interrupted(&scheduler, ScanTarget::Channel(channel.channel_id.clone())).await?;
    print_report(&report);
    Ok(())
}

/// Refreshes stale banners. With `resolve`, channels that never recorded a
/// banner URL are looked up through the listing tool first.
async fn refresh_banners(settings: &MonitorSettings, repo: &ChannelRepository, resolve: bool) {
    let now = Utc::now();
    if resolve {
        let listing = YtDlpListing::new(settings.listing_tool.clone());
        for channel in repo.list() {
            if channel.banner_url.is_some() || !channel.banner_is_stale(now) {
                continue;
            }
            match listing.resolve_channel(&channel.url).await {
                Ok(info) if info.banner_url.is_some() => {
                    if let Err(err) = repo.update_channel(&channel.channel_id, |stored| {
                        stored.banner_url = info.banner_url;
                    }) {
                        warn!(channel_id = %channel.channel_id, "could not store banner url: {err}");
                    }
                }
                Ok(_) => println!("  {}: no banner published", channel.channel_id),
                Err(err) => {
                    warn!(channel_id = %channel.channel_id, "channel lookup failed: {err:#}");
                }
            }
        }
    }

    let cache = BannerCache::new(settings.banner_dir.clone());
    for (channel_id, outcome) in cache.refresh_stale(repo, now).await {
        match outcome {
            Ok(BannerRefresh::Downloaded(path)) => {
                println!("  {channel_id}: banner saved to {}", path.display());
            }
            Ok(BannerRefresh::Fresh) => {}
            Err(err) => println!("  {channel_id}: banner refresh failed ({err:#})"),
        }
    }
}

async fn scan_until_interrupted(scheduler: &Scheduler, target: ScanTarget) -> Result<ScanReport> {
    let mut events = scheduler.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ScanEvent::ChannelStarted {
                    channel_id,
                    index,
                    total,
                } => println!("[{}/{}] Scanning {}", index + 1, total, channel_id),
                ScanEvent::Finished(_) => break,
                _ => {}
            }
        }
    });

    let scan = scheduler.manual_scan(target);
    tokio::pin!(scan);
    let finished = tokio::select! {
        report = &mut scan => Some(report),
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("Failed to install Ctrl+C handler: {err}");
            }
            None
        }
    };
    let report = match finished {
        Some(report) => report,
        None => {
            println!("Cancelling scan...");
            scheduler.cancel_scan();
            scan.await
        }
    };
    progress.abort();
    Ok(report?)
}

async fn watch(settings: &MonitorSettings, repo: Arc<ChannelRepository>) -> Result<()> {
    let scheduler = Arc::new(build_scheduler(settings, repo)?);
    let shutdown = CancellationToken::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
        trigger.cancel();
    });

    let mut events = scheduler.subscribe();
    let countdown = scheduler.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ScanEvent::Finished(report) = event {
                println!(
                    "Scan finished: {} new video(s); next scan in {}s",
                    report.added(),
                    countdown.seconds_until_next_scan()
                );
            }
        }
    });

    println!(
        "Watching {} channel(s); next scan in {}s (Ctrl+C to stop)",
        scheduler.repository().channel_ids().len(),
        scheduler.seconds_until_next_scan()
    );
    scheduler.run_idle_loop(shutdown).await;
    if scheduler.repository().is_dirty() {
        scheduler
            .repository()
            .flush()
            .context("writing pending channel changes")?;
    }
    Ok(())
}

fn list_channels(repo: &ChannelRepository) {
    let channels = repo.list();
    if channels.is_empty() {
        println!("No channels are monitored yet.");
        return;
    }
    for channel in channels {
        let checked = channel
            .last_checked
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}  {}  {} new  (last checked {})",
            channel.channel_id,
            channel.name,
            channel.new_count(),
            checked
        );
        println!("    {}", channel.url);
    }
}

fn print_videos(channel: &Channel, cap: usize) {
    println!("{} ({} new)", channel.name, channel.new_count());
    for video in channel.visible_videos(cap) {
        let affordances = video.status.affordances();
        let date = video
            .upload_date
            .map(|date| date.to_string())
            .unwrap_or_else(|| "----------".to_string());
        let duration = video.duration_text().unwrap_or_default();
        println!(
            "  {:<11} {} {:>8}  {:<10} {}",
            video.video_id,
            date,
            duration,
            affordances.badge.unwrap_or(video.status.as_str()),
            video.title
        );
    }
    let hidden = channel.videos.len().saturating_sub(cap);
    if hidden > 0 {
        println!("  ... {hidden} older video(s) not shown");
    }
}

fn print_report(report: &ScanReport) {
    for channel in &report.channels {
        match &channel.outcome {
            ChannelScanOutcome::Merged {
                summary,
                backfill,
                partial,
            } => {
                let dates = match backfill {
                    BackfillOutcome::Applied { filled, .. } => format!(", {filled} date(s) filled"),
                    BackfillOutcome::Failed(err) => format!(", dates unavailable ({err})"),
                    BackfillOutcome::Skipped => String::new(),
                };
                let note = if *partial { " (listing incomplete)" } else { "" };
                println!(
                    "  {}: {} new, {} already downloaded{dates}{note}",
                    channel.channel_id,
                    summary.added.len(),
                    summary.already_downloaded
                );
            }
            ChannelScanOutcome::ListingUnavailable => {
                println!("  {}: listing tool unavailable", channel.channel_id);
            }
            ChannelScanOutcome::ListingFailed { code } => {
                let code = code.map_or_else(|| "signal".to_string(), |code| code.to_string());
                println!("  {}: listing tool failed (exit {code})", channel.channel_id);
            }
            ChannelScanOutcome::Cancelled => println!("  {}: cancelled", channel.channel_id),
            ChannelScanOutcome::Failed(reason) => {
                println!("  {}: failed ({reason})", channel.channel_id);
            }
        }
    }
    if report.cancelled {
        println!("Scan cancelled; {} new video(s) kept.", report.added());
    } else {
        println!("Scan complete; {} new video(s).", report.added());
    }
}
