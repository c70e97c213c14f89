//! Utility functions for common operations.
//!
//! This module provides text processing used at the ingestion and publishing
//! boundaries:
//!
//! - **Normalization**: decode HTML entities and drop markup from feed/page text,
//!   or only tidy whitespace for text that is already plain
//! - **Truncation**: character-budgeted truncation with an ellipsis marker
//! - **Sanitizing**: strip control characters and ANSI escapes
//!
//! # Examples
//!
//! ```
//! use feedpost::util::{html_to_text, truncate_chars};
//!
//! let title = html_to_text("Fish &amp; Chips");
//! assert_eq!(title, "Fish & Chips");
//!
//! let short = truncate_chars(&title, 6);
//! assert_eq!(short, "Fish..");
//! ```

mod http;
mod text;

pub(crate) use http::{read_limited, BodyError};

pub use text::{
    html_to_text, normalize_plain, strip_control_chars, truncate_chars, ELLIPSIS, ELLIPSIS_LEN,
};
