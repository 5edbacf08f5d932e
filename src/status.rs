#![forbid(unsafe_code)]

//! Per-video review status and the actions that move it.
//!
//! `Downloaded` is terminal: once the download pipeline reports a finished
//! file, no user action leaves that state and the presentation swaps the
//! download affordance for a play one.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoStatus {
    New,
    Snoozed,
    Watched,
    Downloaded,
    Ignored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoAction {
    Snooze,
    Unsnooze,
    Open,
    Ignore,
    Wake,
    DownloadCompleted,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot {action} a video that is {from}")]
pub struct TransitionError {
    pub from: VideoStatus,
    pub action: VideoAction,
}

impl VideoStatus {
    /// Initial status for a newly discovered video.
    pub fn initial(already_downloaded: bool) -> Self {
        if already_downloaded {
            Self::Downloaded
        } else {
            Self::New
        }
    }

    pub fn apply(self, action: VideoAction) -> Result<Self, TransitionError> {
        use VideoAction::*;
        use VideoStatus::*;

        let next = match (self, action) {
            (New, Snooze) => Snoozed,
            (New, Open) => Watched,
            (New, Ignore) => Ignored,
            (Snoozed | Watched, Unsnooze) => New,
            (Ignored, Wake) => New,
            (New | Snoozed | Watched, DownloadCompleted) => Downloaded,
            (from, action) => return Err(TransitionError { from, action }),
        };
        Ok(next)
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Downloaded
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Snoozed => "snoozed",
            Self::Watched => "watched",
            Self::Downloaded => "downloaded",
            Self::Ignored => "ignored",
        }
    }

    /// What a video card shows and allows for this status.
    pub fn affordances(self) -> Affordances {
        let primary = if self == Self::Downloaded {
            PrimaryAction::Play
        } else {
            PrimaryAction::Download
        };
        Affordances {
            badge: match self {
                Self::New => Some("NEW"),
                Self::Snoozed => Some("Snoozed"),
                Self::Watched => Some("Watched"),
                Self::Downloaded => Some("Downloaded"),
                Self::Ignored => None,
            },
            primary,
            can_snooze: self == Self::New,
            can_unsnooze: matches!(self, Self::Snoozed | Self::Watched),
            can_ignore: self == Self::New,
            can_wake: self == Self::Ignored,
        }
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl VideoAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "snooze" => Some(Self::Snooze),
            "unsnooze" => Some(Self::Unsnooze),
            "open" | "view" | "watch" => Some(Self::Open),
            "ignore" => Some(Self::Ignore),
            "wake" => Some(Self::Wake),
            "downloaded" | "download-completed" => Some(Self::DownloadCompleted),
            _ => None,
        }
    }
}

impl fmt::Display for VideoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Snooze => "snooze",
            Self::Unsnooze => "unsnooze",
            Self::Open => "open",
            Self::Ignore => "ignore",
            Self::Wake => "wake",
            Self::DownloadCompleted => "mark as downloaded",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimaryAction {
    Download,
    Play,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Affordances {
    pub badge: Option<&'static str>,
    pub primary: PrimaryAction,
    pub can_snooze: bool,
    pub can_unsnooze: bool,
    pub can_ignore: bool,
    pub can_wake: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snooze_then_unsnooze_returns_to_new() {
        let status = VideoStatus::New.apply(VideoAction::Snooze).unwrap();
        assert_eq!(status, VideoStatus::Snoozed);
        assert_eq!(
            status.apply(VideoAction::Unsnooze).unwrap(),
            VideoStatus::New
        );
    }

    #[test]
    fn ignore_then_wake_returns_to_new() {
        let status = VideoStatus::New.apply(VideoAction::Ignore).unwrap();
        assert_eq!(status.apply(VideoAction::Wake).unwrap(), VideoStatus::New);
    }

    #[test]
    fn watched_can_be_unsnoozed() {
        let status = VideoStatus::New.apply(VideoAction::Open).unwrap();
        assert_eq!(status, VideoStatus::Watched);
        assert_eq!(
            status.apply(VideoAction::Unsnooze).unwrap(),
            VideoStatus::New
        );
    }

    #[test]
    fn downloaded_is_terminal() {
        for action in [
            VideoAction::Snooze,
            VideoAction::Unsnooze,
            VideoAction::Open,
            VideoAction::Ignore,
            VideoAction::Wake,
            VideoAction::DownloadCompleted,
        ] {
            let err = VideoStatus::Downloaded.apply(action).unwrap_err();
            assert_eq!(err.from, VideoStatus::Downloaded);
        }
        assert!(VideoStatus::Downloaded.is_terminal());
    }

    #[test]
    fn ignored_rejects_everything_but_wake() {
        assert!(VideoStatus::Ignored.apply(VideoAction::Snooze).is_err());
        assert!(
            VideoStatus::Ignored
                .apply(VideoAction::DownloadCompleted)
                .is_err()
        );
        assert!(VideoStatus::Ignored.apply(VideoAction::Wake).is_ok());
    }

    #[test]
    fn initial_status_depends_on_history() {
        assert_eq!(VideoStatus::initial(true), VideoStatus::Downloaded);
        assert_eq!(VideoStatus::initial(false), VideoStatus::New);
    }

    #[test]
    fn affordances_follow_status() {
        let new = VideoStatus::New.affordances();
        assert_eq!(new.primary, PrimaryAction::Download);
        assert!(new.can_snooze && new.can_ignore && !new.can_wake);

        let done = VideoStatus::Downloaded.affordances();
        assert_eq!(done.primary, PrimaryAction::Play);
        assert!(!done.can_snooze && !done.can_ignore && !done.can_unsnooze);

        let ignored = VideoStatus::Ignored.affordances();
        assert!(ignored.can_wake);
        assert_eq!(ignored.badge, None);
    }

    #[test]
    fn transition_error_reads_naturally() {
        let err = VideoStatus::Downloaded
            .apply(VideoAction::Ignore)
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot ignore a video that is downloaded");
    }

    #[test]
    fn action_parse_accepts_aliases() {
        assert_eq!(VideoAction::parse("View"), Some(VideoAction::Open));
        assert_eq!(VideoAction::parse("wake"), Some(VideoAction::Wake));
        assert_eq!(VideoAction::parse("delete"), None);
    }

    #[test]
    fn status_serializes_as_variant_name() {
        let json = serde_json::to_string(&VideoStatus::Snoozed).unwrap();
        assert_eq!(json, "\"Snoozed\"");
    }
}
