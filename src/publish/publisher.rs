use std::future::Future;
use std::sync::Arc;

use secrecy::SecretString;

use super::text::compose_post_text;
use super::{PostCard, PostRef, PublishError, PublishSurface, SurfaceError, UploadedBlobRef};
use crate::content::{Enrichment, ImageAsset};
use crate::feed::FeedEntry;

/// Login identity for the publishing surface.
///
/// Custom `Debug` keeps the password out of logs.
#[derive(Clone)]
pub struct Credentials {
    pub identifier: String,
    pub password: SecretString,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &self.identifier)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Publishes entries through a [`PublishSurface`], authenticating lazily.
///
/// Every operation is attempted first; on failure the publisher logs in once
/// and retries exactly once. A fresh process therefore always sees one failed
/// call before its first success.
pub struct Publisher {
    surface: Arc<dyn PublishSurface>,
    credentials: Credentials,
}

impl Publisher {
    pub fn new(surface: Arc<dyn PublishSurface>, credentials: Credentials) -> Self {
        Self {
            surface,
            credentials,
        }
    }

    pub async fn upload_image(&self, asset: &ImageAsset) -> Result<UploadedBlobRef, PublishError> {
        self.with_login("upload", || {
            self.surface.upload_asset(&asset.bytes, asset.mime_type)
        })
        .await
        .map_err(|e| e.into_publish_error(PublishError::Upload))
    }

    pub async fn publish(&self, text: &str, card: &PostCard) -> Result<PostRef, PublishError> {
        self.with_login("post", || self.surface.create_post(text, card))
            .await
            .map_err(|e| e.into_publish_error(PublishError::Post))
    }

    /// Uploads the image (if any) and creates the post for one entry.
    ///
    /// A failed upload is logged and the post goes out without a thumbnail;
    /// only a failed post is returned as an error.
    pub async fn publish_entry(
        &self,
        entry: &FeedEntry,
        enrichment: &Enrichment,
        image: Option<&ImageAsset>,
    ) -> Result<PostRef, PublishError> {
        let thumb = match image {
            Some(asset) => match self.upload_image(asset).await {
                Ok(blob) => Some(blob),
                Err(e) => {
                    tracing::warn!(id = %entry.id, error = %e, "Posting without thumbnail");
                    None
                }
            },
            None => None,
        };

        let card = PostCard {
            uri: entry.link.to_string(),
            title: entry.title.clone(),
            description: enrichment.description.clone(),
            thumb,
        };
        let text = compose_post_text(&entry.title, &card.uri);

        let post = self.publish(&text, &card).await?;
        tracing::info!(id = %entry.id, uri = %post.uri, "Published entry");
        Ok(post)
    }

    async fn with_login<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, RetryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SurfaceError>>,
    {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(op = op, error = %e, "Call failed, re-authenticating");
            }
        }

        self.surface
            .authenticate(&self.credentials.identifier, &self.credentials.password)
            .await
            .map_err(RetryError::Auth)?;
        tracing::debug!(identifier = %self.credentials.identifier, "Authenticated");

        call().await.map_err(RetryError::Call)
    }
}

/// Which step of the retry sequence gave up.
enum RetryError {
    Auth(SurfaceError),
    Call(SurfaceError),
}

impl RetryError {
    fn into_publish_error(self, wrap: fn(SurfaceError) -> PublishError) -> PublishError {
        match self {
            RetryError::Auth(e) => PublishError::Auth(e),
            RetryError::Call(e) => wrap(e),
        }
    }
}
