#![forbid(unsafe_code)]

//! Publish-date backfill from the provider's per-channel Atom feed.
//!
//! Flat listings carry no upload dates, so after a merge the channel's feed
//! (roughly the 15 most recent uploads) is consulted once. Dates are only
//! written into videos that do not have one yet. Any failure here is
//! reported but never stops the scan.

use std::{future::Future, io, time::Duration};

use chrono::{DateTime, NaiveDate};
use quick_xml::{Reader, events::Event};
use thiserror::Error;

use crate::model::Channel;

pub const FEED_ENDPOINT: &str = "https://www.youtube.com/feeds/videos.xml";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("feed request timed out after {0:?}")]
    Timeout(Duration),
    #[error("feed request failed: {0}")]
    Http(String),
    #[error("feed document is malformed: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub video_id: String,
    pub published: NaiveDate,
}

/// Result of the backfill step for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// Nothing new was merged and the scan did not ask for a full pass.
    Skipped,
    Applied { feed_entries: usize, filled: usize },
    Failed(FeedError),
}

pub trait FeedSource: Send + Sync {
    fn fetch_entries(
        &self,
        channel_id: &str,
    ) -> impl Future<Output = Result<Vec<FeedEntry>, FeedError>> + Send;
}

#[derive(Clone)]
pub struct HttpFeed {
    agent: ureq::Agent,
    endpoint: String,
    timeout: Duration,
}

impl HttpFeed {
    pub fn new(timeout: Duration) -> Self {
        Self::with_endpoint(FEED_ENDPOINT, timeout)
    }

    pub fn with_endpoint(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn url_for(&self, channel_id: &str) -> String {
        format!("{}?channel_id={channel_id}", self.endpoint)
    }
}

impl FeedSource for HttpFeed {
    async fn fetch_entries(&self, channel_id: &str) -> Result<Vec<FeedEntry>, FeedError> {
        let agent = self.agent.clone();
        let url = self.url_for(channel_id);
        let timeout = self.timeout;
        let body = tokio::task::spawn_blocking(move || fetch_document(&agent, &url, timeout))
            .await
            .map_err(|err| FeedError::Http(err.to_string()))??;
        parse_feed(&body)
    }
}

fn fetch_document(agent: &ureq::Agent, url: &str, timeout: Duration) -> Result<String, FeedError> {
    let response = match agent.get(url).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(code, _)) => {
            return Err(FeedError::Http(format!("status {code} from {url}")));
        }
        Err(ureq::Error::Transport(transport)) => {
            return Err(classify_transport(&transport, timeout));
        }
    };
    response.into_string().map_err(|err| {
        if is_timeout(&err) {
            FeedError::Timeout(timeout)
        } else {
            FeedError::Http(err.to_string())
        }
    })
}

fn classify_transport(transport: &ureq::Transport, timeout: Duration) -> FeedError {
    let timed_out = std::error::Error::source(transport)
        .and_then(|source| source.downcast_ref::<io::Error>())
        .is_some_and(is_timeout);
    if timed_out {
        FeedError::Timeout(timeout)
    } else {
        FeedError::Http(transport.to_string())
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

#[derive(Clone, Copy)]
enum EntryField {
    VideoId,
    AtomId,
    Published,
}

/// Extracts `(video id, publish date)` pairs from an Atom feed. Entries with
/// a missing id or an unreadable date are skipped; broken XML is an error.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>, FeedError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut in_entry = false;
    let mut field: Option<EntryField> = None;
    let mut video_id: Option<String> = None;
    let mut atom_id: Option<String> = None;
    let mut published: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                field = None;
                match start.local_name().as_ref() {
                    b"entry" => {
                        in_entry = true;
                        video_id = None;
                        atom_id = None;
                        published = None;
                    }
                    b"videoId" if in_entry => field = Some(EntryField::VideoId),
                    b"id" if in_entry => field = Some(EntryField::AtomId),
                    b"published" if in_entry => field = Some(EntryField::Published),
                    _ => {}
                }
            }
            Ok(Event::Text(text)) => {
                if let Some(current) = field {
                    let value = text
                        .unescape()
                        .map_err(|err| FeedError::Parse(err.to_string()))?
                        .trim()
                        .to_string();
                    match current {
                        EntryField::VideoId => video_id = Some(value),
                        EntryField::AtomId => atom_id = Some(value),
                        EntryField::Published => published = Some(value),
                    }
                }
            }
            Ok(Event::End(end)) => {
                field = None;
                if end.local_name().as_ref() == b"entry" && in_entry {
                    in_entry = false;
                    let id = video_id.take().or_else(|| {
                        atom_id
                            .take()
                            .and_then(|id| id.strip_prefix("yt:video:").map(str::to_string))
                    });
                    let date = published.take().as_deref().and_then(parse_published);
                    if let (Some(video_id), Some(published)) = (id, date)
                        && !video_id.is_empty()
                    {
                        entries.push(FeedEntry {
                            video_id,
                            published,
                        });
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(FeedError::Parse(err.to_string())),
            Ok(_) => {}
        }
    }

    Ok(entries)
}

fn parse_published(value: &str) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(value)
        .map(|datetime| datetime.date_naive())
        .ok()
        .or_else(|| {
            value
                .get(..10)
                .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
        })
}

/// Copies feed dates into videos whose upload date is still unknown and
/// returns how many were filled.
pub fn apply_dates(channel: &mut Channel, entries: &[FeedEntry]) -> usize {
    let mut filled = 0;
    for entry in entries {
        if let Some(video) = channel.find_video_mut(&entry.video_id)
            && video.upload_date.is_none()
        {
            video.upload_date = Some(entry.published);
            filled += 1;
        }
    }
    filled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::Video, status::VideoStatus};
    use chrono::{TimeZone, Utc};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    const SAMPLE_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015" xmlns:media="http://search.yahoo.com/mrss/" xmlns="http://www.w3.org/2005/Atom">
 <id>yt:channel:UCabc</id>
 <yt:channelId>UCabc</yt:channelId>
 <title>Abc &amp; Friends</title>
 <published>2015-02-01T00:00:00+00:00</published>
 <entry>
  <id>yt:video:vid3</id>
  <yt:videoId>vid3</yt:videoId>
  <title>Newest</title>
  <published>2024-03-03T18:00:05+00:00</published>
  <updated>2024-03-04T01:00:00+00:00</updated>
 </entry>
 <entry>
  <id>yt:video:vid2</id>
  <title>No videoId element</title>
  <published>2024-03-02T09:30:00+00:00</published>
 </entry>
 <entry>
  <id>yt:video:bad</id>
  <yt:videoId>bad</yt:videoId>
  <published>yesterday</published>
 </entry>
 <entry>
  <yt:videoId>vid1</yt:videoId>
  <published>2024-03-01T23:59:59-05:00</published>
 </entry>
</feed>"#;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_entries_and_ignores_channel_level_dates() {
        let entries = parse_feed(SAMPLE_FEED).unwrap();
        assert_eq!(
            entries,
            vec![
                FeedEntry {
                    video_id: "vid3".into(),
                    published: date(2024, 3, 3)
                },
                FeedEntry {
                    video_id: "vid2".into(),
                    published: date(2024, 3, 2)
                },
                FeedEntry {
                    video_id: "vid1".into(),
                    published: date(2024, 3, 1)
                },
            ]
        );
    }

    #[test]
    fn broken_xml_is_a_parse_error() {
        let err = parse_feed("<feed><entry><published>2024</entry></feed>").unwrap_err();
        assert!(matches!(err, FeedError::Parse(_)));
    }

    #[test]
    fn dates_fill_only_unknown_values() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
        let mut channel = Channel::new("UCabc", "Abc", "https://www.youtube.com/@abc", now);
        let mut known = Video::new("vid2", "two", "", None, VideoStatus::New);
        known.upload_date = Some(date(2020, 1, 1));
        channel.videos = vec![
            Video::new("VID3", "three", "", None, VideoStatus::New),
            known,
            Video::new("other", "not in feed", "", None, VideoStatus::New),
        ];

        let entries = parse_feed(SAMPLE_FEED).unwrap();
        let filled = apply_dates(&mut channel, &entries);

        assert_eq!(filled, 1);
        assert_eq!(channel.videos[0].upload_date, Some(date(2024, 3, 3)));
        assert_eq!(channel.videos[1].upload_date, Some(date(2020, 1, 1)));
        assert_eq!(channel.videos[2].upload_date, None);
    }

    fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/feeds/videos.xml")
    }

    #[tokio::test]
    async fn http_feed_fetches_and_parses() {
        let body = "<feed><entry><yt:videoId>zz</yt:videoId><published>2024-01-02T00:00:00+00:00</published></entry></feed>";
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/atom+xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let endpoint = serve_once(response);
        let feed = HttpFeed::with_endpoint(endpoint, Duration::from_secs(5));
        let entries = feed.fetch_entries("UCzz").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].video_id, "zz");
    }

    #[tokio::test]
    async fn http_errors_are_reported() {
        let endpoint = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        let feed = HttpFeed::with_endpoint(endpoint, Duration::from_secs(5));
        let err = feed.fetch_entries("UCzz").await.unwrap_err();
        assert!(matches!(err, FeedError::Http(message) if message.contains("404")));
    }

    #[test]
    fn url_carries_channel_id() {
        let feed = HttpFeed::new(Duration::from_secs(1));
        assert_eq!(
            feed.url_for("UC42"),
            "https://www.youtube.com/feeds/videos.xml?channel_id=UC42"
        );
    }
}
