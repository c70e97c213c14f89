//! AT Protocol (Bluesky) implementation of [`PublishSurface`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

use super::{PostCard, PostRef, PublishSurface, SurfaceError, UploadedBlobRef};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Session established by `createSession`.
struct Session {
    access_jwt: SecretString,
    did: String,
}

/// XRPC client for a Bluesky PDS.
///
/// Holds its session internally; calls made before [`authenticate`] fail
/// with [`SurfaceError::NotAuthenticated`] without touching the network.
///
/// [`authenticate`]: PublishSurface::authenticate
pub struct BlueskyClient {
    client: reqwest::Client,
    service: Url,
    langs: Vec<String>,
    session: RwLock<Option<Session>>,
}

impl BlueskyClient {
    pub fn new(client: reqwest::Client, service: Url) -> Self {
        Self {
            client,
            service,
            langs: Vec::new(),
            session: RwLock::new(None),
        }
    }

    /// BCP-47 language tags attached to every post.
    pub fn with_langs(mut self, langs: Vec<String>) -> Self {
        self.langs = langs;
        self
    }

    fn endpoint(&self, nsid: &str) -> Result<Url, SurfaceError> {
        self.service
            .join(&format!("xrpc/{nsid}"))
            .map_err(|e| SurfaceError::InvalidResponse(format!("bad service URL: {e}")))
    }

    async fn bearer(&self) -> Result<(String, String), SurfaceError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(SurfaceError::NotAuthenticated)?;
        Ok((
            format!("Bearer {}", session.access_jwt.expose_secret()),
            session.did.clone(),
        ))
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, SurfaceError> {
        let response = tokio::time::timeout(REQUEST_TIMEOUT, request.send())
            .await
            .map_err(|_| SurfaceError::Timeout)?
            .map_err(SurfaceError::Network)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed: Option<XrpcErrorBody> = serde_json::from_str(&body).ok();
            let (error, message) = match parsed {
                Some(b) => (b.error.unwrap_or_default(), b.message.unwrap_or_default()),
                None => (String::new(), body),
            };
            return Err(SurfaceError::Xrpc {
                status: status.as_u16(),
                error,
                message,
            });
        }

        let body = response.bytes().await.map_err(SurfaceError::Network)?;
        serde_json::from_slice(&body).map_err(|e| SurfaceError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl PublishSurface for BlueskyClient {
    async fn authenticate(
        &self,
        identifier: &str,
        secret: &SecretString,
    ) -> Result<(), SurfaceError> {
        let url = self.endpoint("com.atproto.server.createSession")?;
        let body = CreateSessionRequest {
            identifier,
            password: secret.expose_secret(),
        };

        let created: CreateSessionResponse = self.send(self.client.post(url).json(&body)).await?;
        tracing::debug!(did = %created.did, handle = %created.handle, "Session created");

        *self.session.write().await = Some(Session {
            access_jwt: SecretString::from(created.access_jwt),
            did: created.did,
        });
        Ok(())
    }

    async fn upload_asset(
        &self,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<UploadedBlobRef, SurfaceError> {
        let (auth, _) = self.bearer().await?;
        let url = self.endpoint("com.atproto.repo.uploadBlob")?;

        let request = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, auth)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(bytes.to_vec());
        let uploaded: UploadBlobResponse = self.send(request).await?;

        Ok(UploadedBlobRef {
            reference: uploaded.blob.reference.link,
            mime_type: uploaded.blob.mime_type,
            size: uploaded.blob.size,
        })
    }

    async fn create_post(&self, text: &str, card: &PostCard) -> Result<PostRef, SurfaceError> {
        let (auth, did) = self.bearer().await?;
        let url = self.endpoint("com.atproto.repo.createRecord")?;

        let record = PostRecord {
            kind: POST_COLLECTION,
            text,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            langs: &self.langs,
            facets: link_facets(text, &card.uri),
            embed: ExternalEmbed {
                kind: "app.bsky.embed.external",
                external: External {
                    uri: &card.uri,
                    title: &card.title,
                    description: &card.description,
                    thumb: card.thumb.as_ref().map(BlobJson::from),
                },
            },
        };
        let body = CreateRecordRequest {
            repo: &did,
            collection: POST_COLLECTION,
            record,
        };

        let request = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, auth)
            .json(&body);
        let created: CreateRecordResponse = self.send(request).await?;

        Ok(PostRef {
            uri: created.uri,
            cid: created.cid,
        })
    }
}

/// Link facet covering the last occurrence of `uri` in `text`, if present.
///
/// Facet indices are UTF-8 byte offsets.
fn link_facets(text: &str, uri: &str) -> Vec<Facet> {
    match text.rfind(uri) {
        Some(start) if !uri.is_empty() => vec![Facet {
            index: ByteSlice {
                byte_start: start,
                byte_end: start + uri.len(),
            },
            features: vec![LinkFeature {
                kind: "app.bsky.richtext.facet#link",
                uri: uri.to_string(),
            }],
        }],
        _ => Vec::new(),
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct CreateSessionRequest<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    access_jwt: String,
    did: String,
    #[serde(default)]
    handle: String,
}

#[derive(Deserialize)]
struct XrpcErrorBody {
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CidLink {
    #[serde(rename = "$link")]
    link: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlobJson {
    #[serde(rename = "$type", default = "blob_type")]
    kind: String,
    #[serde(rename = "ref")]
    reference: CidLink,
    mime_type: String,
    size: u64,
}

fn blob_type() -> String {
    "blob".to_string()
}

impl From<&UploadedBlobRef> for BlobJson {
    fn from(blob: &UploadedBlobRef) -> Self {
        Self {
            kind: blob_type(),
            reference: CidLink {
                link: blob.reference.clone(),
            },
            mime_type: blob.mime_type.clone(),
            size: blob.size,
        }
    }
}

#[derive(Deserialize)]
struct UploadBlobResponse {
    blob: BlobJson,
}

#[derive(Serialize)]
struct CreateRecordRequest<'a> {
    repo: &'a str,
    collection: &'a str,
    record: PostRecord<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PostRecord<'a> {
    #[serde(rename = "$type")]
    kind: &'static str,
    text: &'a str,
    created_at: String,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    langs: &'a [String],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    facets: Vec<Facet>,
    embed: ExternalEmbed<'a>,
}

#[derive(Serialize)]
struct ExternalEmbed<'a> {
    #[serde(rename = "$type")]
    kind: &'static str,
    external: External<'a>,
}

#[derive(Serialize)]
struct External<'a> {
    uri: &'a str,
    title: &'a str,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumb: Option<BlobJson>,
}

#[derive(Debug, Serialize)]
struct Facet {
    index: ByteSlice,
    features: Vec<LinkFeature>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ByteSlice {
    byte_start: usize,
    byte_end: usize,
}

#[derive(Debug, Serialize)]
struct LinkFeature {
    #[serde(rename = "$type")]
    kind: &'static str,
    uri: String,
}

#[derive(Deserialize)]
struct CreateRecordResponse {
    uri: String,
    cid: String,
}
