use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::feed::parser::{parse_feed, FeedEntry, ParseResult};
use crate::pipeline::FeedSource;
use crate::util::{read_limited, BodyError};

const MAX_RETRIES: u32 = 3;
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while retrieving or parsing the feed.
///
/// Any of these aborts the pipeline run before entries are processed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Feed XML could not be parsed as RSS or Atom
    #[error("Parse error: {0}")]
    Parse(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

impl From<BodyError> for FetchError {
    fn from(e: BodyError) -> Self {
        match e {
            BodyError::Network(e) => FetchError::Network(e),
            BodyError::TooLarge(_) => FetchError::ResponseTooLarge,
            BodyError::Incomplete { expected, received } => {
                FetchError::IncompleteResponse { expected, received }
            }
        }
    }
}

/// Tuning for feed requests.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub timeout: Duration,
    /// First retry delay; doubles on each subsequent retry.
    pub backoff_base: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// Feed source backed by HTTP.
#[derive(Debug, Clone)]
pub struct HttpFeedFetcher {
    client: reqwest::Client,
    url: Url,
    settings: FetchSettings,
}

impl HttpFeedFetcher {
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        Self {
            client,
            url,
            settings: FetchSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: FetchSettings) -> Self {
        self.settings = settings;
        self
    }
}

#[async_trait]
impl FeedSource for HttpFeedFetcher {
    async fn fetch(&self) -> Result<Vec<FeedEntry>, FetchError> {
        fetch_feed(&self.client, &self.url, &self.settings).await
    }
}

/// Fetches and parses the feed at `url`.
///
/// Entries come back in document order (usually newest first).
///
/// # Behavior
///
/// - Each request is bounded by `settings.timeout`
/// - HTTP 429 and 5xx responses are retried up to 3 times with exponential backoff
/// - Other non-2xx responses fail immediately with [`FetchError::HttpStatus`]
/// - Bodies larger than 10MB fail with [`FetchError::ResponseTooLarge`]
/// - Truncated bodies (shorter than Content-Length) are retried
pub async fn fetch_feed(
    client: &reqwest::Client,
    url: &Url,
    settings: &FetchSettings,
) -> Result<Vec<FeedEntry>, FetchError> {
    let mut retry_count = 0;

    let bytes = loop {
        let response = tokio::time::timeout(settings.timeout, client.get(url.clone()).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            if retry_count >= MAX_RETRIES {
                return Err(if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    FetchError::RateLimited(MAX_RETRIES)
                } else {
                    FetchError::HttpStatus(status.as_u16())
                });
            }

            let delay = settings.backoff_base * 2u32.pow(retry_count);
            tracing::warn!(
                feed = %url,
                status = %status,
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Feed request failed, backing off"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
            continue;
        }

        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        match read_limited(response, MAX_FEED_SIZE).await.map_err(FetchError::from) {
            Ok(bytes) => break bytes,
            Err(FetchError::IncompleteResponse { expected, received }) => {
                if retry_count >= MAX_RETRIES {
                    return Err(FetchError::IncompleteResponse { expected, received });
                }

                let delay = settings.backoff_base * 2u32.pow(retry_count);
                tracing::debug!(
                    feed = %url,
                    expected = expected,
                    received = received,
                    attempt = retry_count + 1,
                    "Retrying incomplete download"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
            }
            Err(e) => return Err(e),
        }
    };

    let ParseResult { entries, skipped } =
        parse_feed(&bytes, Some(url)).map_err(|e| FetchError::Parse(e.to_string()))?;

    if skipped > 0 {
        tracing::warn!(feed = %url, skipped = skipped, "Feed entries without a usable link skipped");
    }
    tracing::debug!(feed = %url, entries = entries.len(), "Fetched feed");

    Ok(entries)
}
