use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use thiserror::Error;
use url::Url;

use crate::feed::FeedEntry;
use crate::pipeline::PageSource;
use crate::util::{html_to_text, read_limited, truncate_chars, BodyError};

const MAX_PAGE_SIZE: usize = 5 * 1024 * 1024; // 5MB
const PAGE_TIMEOUT: Duration = Duration::from_secs(20);

/// Placeholder card image for pages that offer no image of their own.
pub const DEFAULT_FALLBACK_IMAGE_URL: &str = "https://bsky.app/static/apple-touch-icon.png";

/// Upper bound for any card description.
pub const MAX_DESCRIPTION_CHARS: usize = 300;
/// Budget for the title-derived description used when scraping yields nothing.
pub const FALLBACK_DESCRIPTION_CHARS: usize = 200;

/// Meta tags consulted for the description, first match wins.
const DESCRIPTION_SELECTORS: &[&str] = &[
    r#"meta[property="og:description"], meta[name="og:description"]"#,
    r#"meta[name="twitter:description"], meta[property="twitter:description"]"#,
    r#"meta[name="description"]"#,
];

/// Meta tags consulted for the image, first match wins.
const IMAGE_META_SELECTORS: &[&str] = &[
    r#"meta[property="og:image"], meta[name="og:image"]"#,
    r#"meta[name="twitter:image"], meta[property="twitter:image"], meta[name="twitter:image:src"]"#,
];

/// Content regions searched for a first `<img>` after the meta tags.
/// Order matters: semantic containers first, common blog classes last.
const IMAGE_REGION_SELECTORS: &[&str] = &[
    "article img",
    "main img",
    ".entry-content img, .post-content img, .article-content img, .post-body img, .content img",
];

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("Request timed out after {}s", PAGE_TIMEOUT.as_secs())]
    Timeout,
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

impl From<BodyError> for EnrichError {
    fn from(e: BodyError) -> Self {
        match e {
            BodyError::Network(e) => EnrichError::Network(e),
            BodyError::TooLarge(limit) => EnrichError::ResponseTooLarge(limit),
            BodyError::Incomplete { expected, received } => {
                EnrichError::IncompleteResponse { expected, received }
            }
        }
    }
}

/// Metadata scraped from a page; `None` where the page had nothing usable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMetadata {
    pub description: Option<String>,
    pub image: Option<Url>,
}

/// What the pipeline attaches to a post card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrichment {
    pub description: String,
    pub image_url: Option<Url>,
}

impl Enrichment {
    /// Degraded enrichment: description from the title, no image.
    pub fn fallback(title: &str) -> Self {
        Self {
            description: truncate_chars(title, FALLBACK_DESCRIPTION_CHARS).into_owned(),
            image_url: None,
        }
    }
}

/// Scrapes an entry's page for a description and representative image.
#[derive(Debug, Clone)]
pub struct PageEnricher {
    client: reqwest::Client,
    fallback_image: Option<Url>,
}

impl PageEnricher {
    /// Enricher whose image chain ends at [`DEFAULT_FALLBACK_IMAGE_URL`].
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            fallback_image: Url::parse(DEFAULT_FALLBACK_IMAGE_URL).ok(),
        }
    }

    /// Image used when a page parses but offers no candidate image. `None`
    /// leaves such pages without an image.
    pub fn with_fallback_image(mut self, url: Option<Url>) -> Self {
        self.fallback_image = url;
        self
    }

    async fn fetch_page(&self, url: &Url) -> Result<String, EnrichError> {
        let response = tokio::time::timeout(PAGE_TIMEOUT, self.client.get(url.clone()).send())
            .await
            .map_err(|_| EnrichError::Timeout)?
            .map_err(EnrichError::Network)?;

        if !response.status().is_success() {
            return Err(EnrichError::HttpStatus(response.status().as_u16()));
        }

        // Some sites serve latin-1 pages; lossy decoding keeps the meta tags usable
        let bytes = read_limited(response, MAX_PAGE_SIZE).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[async_trait]
impl PageSource for PageEnricher {
    async fn enrich(&self, entry: &FeedEntry) -> Enrichment {
        let html = match self.fetch_page(&entry.link).await {
            Ok(html) => html,
            Err(e) => {
                tracing::warn!(
                    id = %entry.id,
                    url = %entry.link,
                    error = %e,
                    "Page fetch failed, using fallback description"
                );
                return Enrichment::fallback(&entry.title);
            }
        };

        let meta = extract_metadata(&html, &entry.link);
        let description = match meta.description {
            Some(d) => d,
            None => Enrichment::fallback(&entry.title).description,
        };
        let image_url = meta.image.or_else(|| self.fallback_image.clone());

        tracing::debug!(
            id = %entry.id,
            image = image_url.as_ref().map(Url::as_str).unwrap_or("none"),
            "Enriched entry"
        );

        Enrichment {
            description,
            image_url,
        }
    }
}

/// Extracts description and image from an HTML document.
///
/// Relative image URLs are resolved against `page_url`. Only http(s) images
/// are returned.
pub fn extract_metadata(html: &str, page_url: &Url) -> PageMetadata {
    let doc = Html::parse_document(html);

    let description = DESCRIPTION_SELECTORS
        .iter()
        .filter_map(|s| meta_content(&doc, s))
        .map(|d| html_to_text(&d))
        .find(|d| !d.is_empty())
        .map(|d| truncate_chars(&d, MAX_DESCRIPTION_CHARS).into_owned());

    let image = IMAGE_META_SELECTORS
        .iter()
        .filter_map(|s| meta_content(&doc, s))
        .find_map(|src| resolve_image(&src, page_url))
        .or_else(|| {
            IMAGE_REGION_SELECTORS
                .iter()
                .find_map(|s| first_image_src(&doc, s, page_url))
        });

    PageMetadata { description, image }
}

fn meta_content(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .filter_map(|el| el.value().attr("content"))
        .map(str::trim)
        .find(|c| !c.is_empty())
        .map(str::to_string)
}

fn first_image_src(doc: &Html, selector: &str, page_url: &Url) -> Option<Url> {
    let sel = Selector::parse(selector).ok()?;
    let img = doc.select(&sel).next()?;
    // Lazy-loading themes park the real source in data-src
    ["src", "data-src"]
        .iter()
        .filter_map(|attr| img.value().attr(attr))
        .find_map(|src| resolve_image(src, page_url))
}

fn resolve_image(src: &str, page_url: &Url) -> Option<Url> {
    let src = src.trim();
    if src.is_empty() || src.starts_with("data:") {
        return None;
    }
    let url = page_url.join(src).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn page() -> Url {
        Url::parse("https://news.example.com/2024/story.html").unwrap()
    }

    #[test]
    fn test_og_image_wins() {
        let html = r#"<html><head>
            <meta name="twitter:image" content="https://cdn.example.com/tw.jpg">
            <meta property="og:image" content="https://cdn.example.com/og.jpg">
        </head><body><article><img src="/a.jpg"></article></body></html>"#;
        let meta = extract_metadata(html, &page());
        assert_eq!(meta.image.unwrap().as_str(), "https://cdn.example.com/og.jpg");
    }

    #[test]
    fn test_twitter_image_before_article() {
        let html = r#"<html><head>
            <meta name="twitter:image" content="https://cdn.example.com/tw.jpg">
        </head><body><article><img src="/a.jpg"></article></body></html>"#;
        let meta = extract_metadata(html, &page());
        assert_eq!(meta.image.unwrap().as_str(), "https://cdn.example.com/tw.jpg");
    }

    #[test]
    fn test_article_before_main() {
        let html = r#"<body><main><img src="/main.jpg"></main>
            <article><img src="/article.jpg"></article></body>"#;
        let meta = extract_metadata(html, &page());
        assert_eq!(
            meta.image.unwrap().as_str(),
            "https://news.example.com/article.jpg"
        );
    }

    #[test]
    fn test_main_then_content_region() {
        let html = r#"<body><div class="entry-content"><img src="entry.jpg"></div>
            <main><img src="main.jpg"></main></body>"#;
        let meta = extract_metadata(html, &page());
        assert_eq!(
            meta.image.unwrap().as_str(),
            "https://news.example.com/2024/main.jpg"
        );

        let html = r#"<body><div class="post-content"><img src="entry.jpg"></div></body>"#;
        let meta = extract_metadata(html, &page());
        assert_eq!(
            meta.image.unwrap().as_str(),
            "https://news.example.com/2024/entry.jpg"
        );
    }

    #[test]
    fn test_relative_meta_image_is_resolved() {
        let html = r#"<head><meta property="og:image" content="/img/lead.png"></head>"#;
        let meta = extract_metadata(html, &page());
        assert_eq!(
            meta.image.unwrap().as_str(),
            "https://news.example.com/img/lead.png"
        );
    }

    #[test]
    fn test_data_uri_and_lazy_src() {
        let html = r#"<article><img src="data:image/gif;base64,R0lGOD" data-src="/real.jpg"></article>"#;
        let meta = extract_metadata(html, &page());
        assert_eq!(meta.image.unwrap().as_str(), "https://news.example.com/real.jpg");
    }

    #[test]
    fn test_no_image_found() {
        let meta = extract_metadata("<html><body><p>Text</p></body></html>", &page());
        assert!(meta.image.is_none());
        assert!(meta.description.is_none());
    }

    #[test]
    fn test_description_chain() {
        let html = r#"<head>
            <meta name="description" content="Plain description">
            <meta property="og:description" content="OG &amp; better">
        </head>"#;
        let meta = extract_metadata(html, &page());
        assert_eq!(meta.description.as_deref(), Some("OG & better"));

        let html = r#"<head><meta name="description" content="  Plain description "></head>"#;
        let meta = extract_metadata(html, &page());
        assert_eq!(meta.description.as_deref(), Some("Plain description"));
    }

    #[test]
    fn test_description_is_bounded() {
        let long = "word ".repeat(200);
        let html = format!(r#"<head><meta property="og:description" content="{long}"></head>"#);
        let meta = extract_metadata(&html, &page());
        assert!(meta.description.unwrap().chars().count() <= MAX_DESCRIPTION_CHARS);
    }

    #[test]
    fn test_fallback_truncates_title() {
        let title = "t".repeat(500);
        let fallback = Enrichment::fallback(&title);
        assert_eq!(fallback.description.chars().count(), FALLBACK_DESCRIPTION_CHARS);
        assert!(fallback.description.ends_with(".."));
        assert!(fallback.image_url.is_none());
    }

    fn entry_at(url: String) -> FeedEntry {
        FeedEntry {
            id: "e1".into(),
            title: "Budget blowout puts councils on notice".into(),
            link: Url::parse(&url).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_enrich_from_page() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/story"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><head><meta property="og:description" content="Desc">
                <meta property="og:image" content="/lead.jpg"></head></html>"#,
            ))
            .mount(&mock_server)
            .await;

        let enricher = PageEnricher::new(reqwest::Client::new());
        let result = enricher
            .enrich(&entry_at(format!("{}/story", mock_server.uri())))
            .await;

        assert_eq!(result.description, "Desc");
        assert_eq!(
            result.image_url.unwrap().as_str(),
            format!("{}/lead.jpg", mock_server.uri())
        );
    }

    #[tokio::test]
    async fn test_enrich_uses_fallback_image_when_page_has_none() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>no images</p>"))
            .mount(&mock_server)
            .await;

        let fallback = Url::parse("https://static.example.com/placeholder.png").unwrap();
        let enricher =
            PageEnricher::new(reqwest::Client::new()).with_fallback_image(Some(fallback.clone()));
        let result = enricher
            .enrich(&entry_at(format!("{}/story", mock_server.uri())))
            .await;

        assert_eq!(result.image_url, Some(fallback));
        assert_eq!(result.description, "Budget blowout puts councils on notice");
    }

    #[tokio::test]
    async fn test_enrich_defaults_to_placeholder_image() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><head><meta name="description" content="Words only"></head>
                <body><article><p>No pictures here</p></article></body></html>"#,
            ))
            .mount(&mock_server)
            .await;

        let result = PageEnricher::new(reqwest::Client::new())
            .enrich(&entry_at(format!("{}/story", mock_server.uri())))
            .await;

        assert_eq!(result.description, "Words only");
        assert_eq!(
            result.image_url.as_ref().map(Url::as_str),
            Some(DEFAULT_FALLBACK_IMAGE_URL)
        );
    }

    #[tokio::test]
    async fn test_enrich_without_fallback_image() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>no images</p>"))
            .mount(&mock_server)
            .await;

        let result = PageEnricher::new(reqwest::Client::new())
            .with_fallback_image(None)
            .enrich(&entry_at(format!("{}/story", mock_server.uri())))
            .await;

        assert!(result.image_url.is_none());
    }

    #[tokio::test]
    async fn test_enrich_http_error_degrades() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let fallback = Url::parse("https://static.example.com/placeholder.png").unwrap();
        let enricher =
            PageEnricher::new(reqwest::Client::new()).with_fallback_image(Some(fallback));
        let entry = entry_at(format!("{}/story", mock_server.uri()));
        let result = enricher.enrich(&entry).await;

        assert_eq!(result, Enrichment::fallback(&entry.title));
    }

    #[tokio::test]
    async fn test_enrich_network_error_degrades() {
        // Port 9 (discard) on localhost is closed in test environments
        let entry = entry_at("http://127.0.0.1:9/story".to_string());
        let result = PageEnricher::new(reqwest::Client::new()).enrich(&entry).await;
        assert!(result.image_url.is_none());
        assert_eq!(result.description, entry.title);
    }
}
