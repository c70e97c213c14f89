//! Publishing entries as posts with external link cards.
//!
//! - [`PublishSurface`] - the three calls the pipeline needs from a social
//!   platform: authenticate, upload a blob, create a post
//! - [`BlueskyClient`] - `PublishSurface` over AT Protocol XRPC
//! - [`Publisher`] - retry-after-login wrapper and post composition
//!
//! The surface is injected into the [`Publisher`] rather than held globally,
//! so tests substitute a fake.

mod bluesky;
mod publisher;
mod text;

use async_trait::async_trait;
use secrecy::SecretString;
use thiserror::Error;

pub use bluesky::BlueskyClient;
pub use publisher::{Credentials, Publisher};
pub use text::{compose_post_text, truncate_title, POST_CHAR_LIMIT, TEXT_RESERVE};

/// Errors from a single call against the publishing surface.
#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("Request timed out")]
    Timeout,
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    /// The call needs a session and none is established yet.
    #[error("Not authenticated")]
    NotAuthenticated,
    /// The server answered with an XRPC error body.
    #[error("XRPC error (status {status}): {error}: {message}")]
    Xrpc {
        status: u16,
        error: String,
        message: String,
    },
    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
}

/// A publish operation that still failed after re-authenticating.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Authentication failed: {0}")]
    Auth(#[source] SurfaceError),
    #[error("Image upload failed: {0}")]
    Upload(#[source] SurfaceError),
    #[error("Post creation failed: {0}")]
    Post(#[source] SurfaceError),
}

/// Reference to an uploaded blob, as returned by the surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedBlobRef {
    /// Opaque content reference (a CID on AT Protocol).
    pub reference: String,
    pub mime_type: String,
    pub size: u64,
}

/// External link card attached to a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostCard {
    pub uri: String,
    pub title: String,
    pub description: String,
    pub thumb: Option<UploadedBlobRef>,
}

/// Identifies a created post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRef {
    pub uri: String,
    pub cid: String,
}

/// Outbound operations on the social platform.
#[async_trait]
pub trait PublishSurface: Send + Sync {
    async fn authenticate(&self, identifier: &str, secret: &SecretString)
        -> Result<(), SurfaceError>;

    async fn upload_asset(
        &self,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<UploadedBlobRef, SurfaceError>;

    async fn create_post(&self, text: &str, card: &PostCard) -> Result<PostRef, SurfaceError>;
}
