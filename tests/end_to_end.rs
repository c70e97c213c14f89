//! Full run with the real HTTP components against a mock server standing in
//! for the feed host, the article pages and the PDS.

use std::io::Cursor;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::{json, Value};
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use feedpost::content::{ImageCompressor, PageEnricher};
use feedpost::feed::{FetchSettings, HttpFeedFetcher};
use feedpost::pipeline::{Clock, Components, Jitter, Pipeline, PipelineSettings, RunOutcome};
use feedpost::publish::{BlueskyClient, Credentials, Publisher};
use feedpost::storage::DedupStore;

struct StillClock(AtomicI64);

#[async_trait]
impl Clock for StillClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        self.0.fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }
}

struct NoJitter;

impl Jitter for NoJitter {
    fn between(&self, low: Duration, _high: Duration) -> Duration {
        low
    }
}

fn rss(base: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Example News</title>
  <link>{base}/</link>
  <item>
    <guid>a1</guid>
    <title>Rates &amp; rents: what changes this week</title>
    <link>{base}/a1</link>
  </item>
  <item>
    <guid>a2</guid>
    <title>Budget blowout puts councils on notice</title>
    <link>{base}/a2</link>
  </item>
</channel></rss>"#
    )
}

fn png_bytes() -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::from_pixel(1600, 800, Rgb([200, 40, 40])))
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

async fn mount_site(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/rss+xml")
                .set_body_string(rss(&server.uri())),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/a1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><head>
                <meta property="og:description" content="Rents rise again.">
                <meta property="og:image" content="/img/lead.png">
            </head><body><article><p>Body</p></article></body></html>"#,
        ))
        .mount(server)
        .await;

    // a2's page is down; the post goes out with the fallback description
    Mock::given(method("GET"))
        .and(path("/a2"))
        .respond_with(ResponseTemplate::new(503))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/img/lead.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes()))
        .mount(server)
        .await;
}

/// PDS that rejects anything not carrying the token it hands out.
async fn mount_pds(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.server.createSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accessJwt": "jwt-1",
            "did": "did:plc:bot",
            "handle": "bot.example.com"
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.uploadBlob"))
        .respond_with(|req: &Request| {
            if !authorized(req) {
                return unauthorized();
            }
            ResponseTemplate::new(200).set_body_json(json!({
                "blob": {
                    "$type": "blob",
                    "ref": {"$link": "bafkreilead"},
                    "mimeType": "image/jpeg",
                    "size": req.body.len()
                }
            }))
        })
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.createRecord"))
        .respond_with(|req: &Request| {
            if !authorized(req) {
                return unauthorized();
            }
            ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:bot/app.bsky.feed.post/3k",
                "cid": "bafyrecord"
            }))
        })
        .mount(server)
        .await;
}

fn authorized(req: &Request) -> bool {
    req.headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some("Bearer jwt-1")
}

fn unauthorized() -> ResponseTemplate {
    ResponseTemplate::new(401).set_body_json(json!({
        "error": "AuthMissing",
        "message": "Authentication Required"
    }))
}

fn pipeline(server: &MockServer, store: DedupStore) -> Pipeline {
    let client = reqwest::Client::new();
    let base = Url::parse(&format!("{}/", server.uri())).unwrap();

    let surface = BlueskyClient::new(client.clone(), base.clone()).with_langs(vec!["en".into()]);
    let publisher = Publisher::new(
        Arc::new(surface),
        Credentials {
            identifier: "bot.example.com".into(),
            password: SecretString::from("app-password".to_string()),
        },
    );

    let components = Components {
        feed: Arc::new(
            HttpFeedFetcher::new(client.clone(), base.join("feed.xml").unwrap()).with_settings(
                FetchSettings {
                    timeout: Duration::from_secs(5),
                    backoff_base: Duration::ZERO,
                },
            ),
        ),
        pages: Arc::new(PageEnricher::new(client.clone())),
        images: Arc::new(ImageCompressor::new(client)),
        publisher,
        clock: Arc::new(StillClock(AtomicI64::new(1_700_000_000_000))),
        jitter: Arc::new(NoJitter),
    };

    Pipeline::new(store, PipelineSettings::default(), components)
}

fn created_records(requests: &[Request]) -> Vec<Value> {
    requests
        .iter()
        .filter(|r| r.url.path().ends_with("createRecord"))
        .filter(|r| authorized(r))
        .map(|r| serde_json::from_slice::<Value>(&r.body).unwrap()["record"].clone())
        .collect()
}

#[tokio::test]
async fn test_run_against_live_http_components() {
    let server = MockServer::start().await;
    mount_site(&server).await;
    mount_pds(&server).await;

    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("state.json");
    let pipeline = pipeline(&server, DedupStore::new(&store_path));

    let report = match pipeline.run_once().await.unwrap() {
        RunOutcome::Completed(report) => report,
        other => panic!("Expected completed run, got {:?}", other),
    };
    assert_eq!(report.published, 2);
    assert_eq!(report.failed, 0);

    let requests = server.received_requests().await.unwrap();
    let sessions = requests
        .iter()
        .filter(|r| r.url.path().ends_with("createSession"))
        .count();
    assert_eq!(sessions, 1);

    let records = created_records(&requests);
    assert_eq!(records.len(), 2);

    let first = &records[0];
    assert_eq!(
        first["text"],
        json!(format!(
            "Rates & rents: what changes this week\n\n{}/a1",
            server.uri()
        ))
    );
    let external = &first["embed"]["external"];
    assert_eq!(external["description"], json!("Rents rise again."));
    assert_eq!(external["thumb"]["ref"]["$link"], json!("bafkreilead"));
    assert_eq!(first["langs"], json!(["en"]));

    let second = &records[1]["embed"]["external"];
    assert_eq!(second["description"], json!("Budget blowout puts councils on notice"));
    assert!(second.get("thumb").is_none());

    // A flat-colour PNG re-encodes larger as JPEG, so the download goes up as-is
    let upload = requests
        .iter()
        .filter(|r| r.url.path().ends_with("uploadBlob"))
        .find(|r| authorized(r))
        .unwrap();
    let raw = png_bytes();
    assert!(upload.body.len() <= raw.len());
    assert_eq!(upload.body, raw);
    assert_eq!(
        upload
            .headers
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("image/png")
    );

    let stored: Value = serde_json::from_slice(&std::fs::read(&store_path).unwrap()).unwrap();
    assert_eq!(stored["identifiers"], json!(["a1", "a2"]));
    assert_eq!(stored["lastFetchTime"], json!(1_700_000_000_000_i64));
}
