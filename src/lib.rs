#![forbid(unsafe_code)]

//! Channel monitoring and incremental sync.
//!
//! A [`repository::ChannelRepository`] owns the monitored channels, the
//! [`scheduler::ScanScheduler`] keeps them current by merging listings from
//! the external tool, and publish dates are backfilled from the channel feed.

pub mod banner;
pub mod config;
pub mod feed;
pub mod history;
pub mod listing;
pub mod merge;
pub mod model;
pub mod repository;
pub mod scheduler;
pub mod status;
pub mod url;
