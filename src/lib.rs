//! Polls a syndication feed and publishes each new entry as a Bluesky post
//! with a link-preview card.
//!
//! A run is fetch → dedup → enrich → compress → publish → record, driven by
//! [`pipeline::Pipeline::run_once`].

pub mod config;
pub mod content;
pub mod feed;
pub mod pipeline;
pub mod publish;
pub mod storage;
pub mod util;
