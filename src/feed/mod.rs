//! Feed retrieval and parsing.
//!
//! - [`parser`] - RSS/Atom parsing via `feed-rs`, normalizing titles and links
//! - [`fetcher`] - HTTP retrieval with timeout, backoff and size limits
//!
//! # Example
//!
//! ```ignore
//! use feedpost::feed::fetch_feed;
//!
//! let entries = fetch_feed(&client, &url, &FetchSettings::default()).await?;
//! for entry in entries.iter().take(8) {
//!     println!("{} {}", entry.id, entry.title);
//! }
//! ```

mod fetcher;
mod parser;

pub use fetcher::{fetch_feed, FetchError, FetchSettings, HttpFeedFetcher};
pub use parser::{parse_feed, FeedEntry, ParseResult, TitleField};
