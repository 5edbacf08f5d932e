#![forbid(unsafe_code)]

//! Local copies of channel banners, re-fetched once they are a week old.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{model::Channel, repository::ChannelRepository};

const BANNER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BannerRefresh {
    /// The cached file is recent enough and was left alone.
    Fresh,
    Downloaded(PathBuf),
}

#[derive(Clone)]
pub struct BannerCache {
    dir: PathBuf,
    agent: ureq::Agent,
}

impl BannerCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            agent: ureq::AgentBuilder::new().timeout(BANNER_TIMEOUT).build(),
        }
    }

    pub fn path_for(&self, channel_id: &str) -> PathBuf {
        self.dir.join(format!("{channel_id}.jpg"))
    }

    /// Downloads `banner_url` for `channel` when its cached banner is missing
    /// or stale, then records the new file on the stored channel.
    pub async fn refresh(
        &self,
        repo: &ChannelRepository,
        channel: &Channel,
        banner_url: &str,
        now: DateTime<Utc>,
    ) -> Result<BannerRefresh> {
        if !channel.banner_is_stale(now) {
            debug!(channel_id = %channel.channel_id, "banner still fresh");
            return Ok(BannerRefresh::Fresh);
        }

        let target = self.path_for(&channel.channel_id);
        let agent = self.agent.clone();
        let url = banner_url.to_string();
        let dest = target.clone();
        tokio::task::spawn_blocking(move || download_to(&agent, &url, &dest))
            .await
            .context("banner download task failed")??;

        repo.record_banner(&channel.channel_id, target.clone(), now)?;
        info!(channel_id = %channel.channel_id, path = %target.display(), "banner updated");
        Ok(BannerRefresh::Downloaded(target))
    }

    /// Refreshes every stored channel whose banner is missing or past its TTL
    /// and whose banner URL is known. One failure does not stop the rest.
    pub async fn refresh_stale(
        &self,
        repo: &ChannelRepository,
        now: DateTime<Utc>,
    ) -> Vec<(String, Result<BannerRefresh>)> {
        let mut results = Vec::new();
        for channel in repo.list() {
            if !channel.banner_is_stale(now) {
                continue;
            }
            let Some(banner_url) = channel.banner_url.clone() else {
                debug!(channel_id = %channel.channel_id, "no banner url recorded");
                continue;
            };
            let outcome = self.refresh(repo, &channel, &banner_url, now).await;
            if let Err(err) = &outcome {
                warn!(channel_id = %channel.channel_id, "banner refresh failed: {err:#}");
            }
            results.push((channel.channel_id, outcome));
        }
        results
    }
}

fn download_to(agent: &ureq::Agent, url: &str, dest: &Path) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("banner path {} has no parent", dest.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating banner directory {}", parent.display()))?;

    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("requesting banner {url}"))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temp file in {}", parent.display()))?;
    io::copy(&mut response.into_reader(), &mut tmp)
        .with_context(|| format!("downloading banner {url}"))?;
    tmp.flush()?;
    tmp.persist(dest)
        .map_err(|err| err.error)
        .with_context(|| format!("saving banner {}", dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 10, 9, 0, 0).unwrap()
    }

    fn serve_bytes(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(body);
            }
        });
        format!("http://{addr}/banner.jpg")
    }

    #[tokio::test]
    async fn missing_banner_is_downloaded_and_recorded() {
        let dir = tempdir().unwrap();
        let repo = ChannelRepository::open(&dir.path().join("channels.json")).unwrap();
        let channel = Channel::new("UC1", "One", "https://www.youtube.com/@one", now());
        repo.add_channel(channel.clone()).unwrap();

        let cache = BannerCache::new(dir.path().join("banners"));
        let url = serve_bytes(b"\xff\xd8fake-jpeg");
        let outcome = cache.refresh(&repo, &channel, &url, now()).await.unwrap();

        let expected = dir.path().join("banners").join("UC1.jpg");
        assert_eq!(outcome, BannerRefresh::Downloaded(expected.clone()));
        assert_eq!(fs::read(&expected).unwrap(), b"\xff\xd8fake-jpeg");
        let stored = repo.get("UC1").unwrap();
        assert_eq!(stored.banner_path, Some(expected));
        assert_eq!(stored.banner_last_updated, Some(now()));
    }

    #[tokio::test]
    async fn week_old_banners_are_fetched_again() {
        let dir = tempdir().unwrap();
        let repo = ChannelRepository::open(&dir.path().join("channels.json")).unwrap();
        let banners = dir.path().join("banners");
        fs::create_dir_all(&banners).unwrap();

        let mut stale = Channel::new("UCold", "Old", "https://www.youtube.com/@old", now());
        stale.banner_url = Some(serve_bytes(b"new-banner"));
        stale.banner_path = Some(banners.join("UCold.jpg"));
        stale.banner_last_updated = Some(now() - chrono::TimeDelta::days(8));
        fs::write(banners.join("UCold.jpg"), b"old-banner").unwrap();
        repo.add_channel(stale).unwrap();

        let mut fresh = Channel::new("UCnew", "New", "https://www.youtube.com/@new", now());
        fresh.banner_url = Some("http://127.0.0.1:9/none.jpg".into());
        fresh.banner_path = Some(banners.join("UCnew.jpg"));
        fresh.banner_last_updated = Some(now() - chrono::TimeDelta::days(1));
        repo.add_channel(fresh).unwrap();

        repo.add_channel(Channel::new("UCnourl", "No url", "https://www.youtube.com/@x", now()))
            .unwrap();

        let cache = BannerCache::new(&banners);
        let results = cache.refresh_stale(&repo, now()).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "UCold");
        assert!(matches!(results[0].1, Ok(BannerRefresh::Downloaded(_))));
        assert_eq!(fs::read(banners.join("UCold.jpg")).unwrap(), b"new-banner");
        assert_eq!(repo.get("UCold").unwrap().banner_last_updated, Some(now()));
        assert_eq!(
            repo.get("UCnew").unwrap().banner_last_updated,
            Some(now() - chrono::TimeDelta::days(1))
        );
        assert!(repo.get("UCnourl").unwrap().banner_path.is_none());
    }

    #[tokio::test]
    async fn fresh_banner_is_left_alone() {
        let dir = tempdir().unwrap();
        let repo = ChannelRepository::open(&dir.path().join("channels.json")).unwrap();
        let mut channel = Channel::new("UC1", "One", "https://www.youtube.com/@one", now());
        channel.banner_path = Some(dir.path().join("banners/UC1.jpg"));
        channel.banner_last_updated = Some(now() - chrono::TimeDelta::days(2));
        repo.add_channel(channel.clone()).unwrap();

        let cache = BannerCache::new(dir.path().join("banners"));
        // Unroutable URL: a download attempt would fail the test.
        let outcome = cache
            .refresh(&repo, &channel, "http://127.0.0.1:9/none.jpg", now())
            .await
            .unwrap();
        assert_eq!(outcome, BannerRefresh::Fresh);
    }
}
