use feed_rs::parser;
use sha2::{Digest, Sha256};
use url::Url;

use crate::util::{html_to_text, normalize_plain};

/// Title as it arrives in the feed document.
///
/// RSS titles are plain text; Atom titles may be typed `html`/`xhtml`.
/// Both shapes are normalized to plain text by [`TitleField::into_plain`]
/// before anything downstream sees them. Plain titles arrive XML-decoded
/// already, so a literal `<T>` in one is text, not a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleField {
    Plain(String),
    Structured(String),
}

impl TitleField {
    pub fn into_plain(self) -> String {
        match self {
            TitleField::Plain(text) => normalize_plain(&text),
            TitleField::Structured(text) => html_to_text(&text),
        }
    }
}

/// One publishable feed item, normalized at ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub id: String,
    pub title: String,
    pub link: Url,
}

/// Entries parsed from a feed document.
#[derive(Debug, Default)]
pub struct ParseResult {
    /// Entries in document order.
    pub entries: Vec<FeedEntry>,
    /// Number of items dropped because they had no usable link.
    pub skipped: usize,
}

/// Parses RSS/Atom bytes into entries, resolving relative links against `base`.
pub fn parse_feed(bytes: &[u8], base: Option<&Url>) -> Result<ParseResult, parser::ParseFeedError> {
    let feed = parser::parse(bytes)?;

    let mut result = ParseResult::default();
    for entry in feed.entries {
        let href = entry
            .links
            .iter()
            .find(|l| l.rel.as_deref().is_none_or(|rel| rel == "alternate"))
            .or_else(|| entry.links.first())
            .map(|l| l.href.trim().to_string());

        let Some(link) = href.and_then(|h| resolve_link(&h, base)) else {
            result.skipped += 1;
            continue;
        };

        let title_field = match entry.title {
            Some(t) if t.content_type.essence().to_string() == "text/plain" => {
                TitleField::Plain(t.content)
            }
            Some(t) => TitleField::Structured(t.content),
            None => TitleField::Plain(String::new()),
        };
        let mut title = title_field.into_plain();
        if title.is_empty() {
            title = "Untitled".to_string();
        }

        let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());
        let existing_id = if entry.id.is_empty() {
            None
        } else {
            Some(entry.id.as_str())
        };
        let id = generate_guid(existing_id, link.as_str(), &title, published);

        result.entries.push(FeedEntry { id, title, link });
    }

    Ok(result)
}

fn resolve_link(href: &str, base: Option<&Url>) -> Option<Url> {
    if href.is_empty() {
        return None;
    }
    let url = match Url::parse(href) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(href).ok()?,
        Err(_) => return None,
    };
    matches!(url.scheme(), "http" | "https").then_some(url)
}

fn generate_guid(existing: Option<&str>, url: &str, title: &str, published: Option<i64>) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        url,
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>News</title>
  <item><guid>a2</guid><title>Second &amp; newest</title><link>https://example.com/a2</link></item>
  <item><guid>a1</guid><title>First</title><link>https://example.com/a1</link></item>
</channel></rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom News</title>
  <id>urn:feed</id>
  <updated>2024-01-01T00:00:00Z</updated>
  <entry>
    <id>urn:entry:1</id>
    <title type="html">&lt;em&gt;Budget&lt;/em&gt; blowout</title>
    <link rel="alternate" href="/stories/1"/>
    <updated>2024-01-01T00:00:00Z</updated>
  </entry>
</feed>"#;

    #[test]
    fn test_rss_entries_in_document_order() {
        let result = parse_feed(RSS.as_bytes(), None).unwrap();
        let ids: Vec<_> = result.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "a1"]);
        assert_eq!(result.entries[0].title, "Second & newest");
        assert_eq!(result.entries[0].link.as_str(), "https://example.com/a2");
    }

    #[test]
    fn test_atom_structured_title_and_relative_link() {
        let base = Url::parse("https://news.example.org/feed.xml").unwrap();
        let result = parse_feed(ATOM.as_bytes(), Some(&base)).unwrap();
        assert_eq!(result.entries.len(), 1);
        let entry = &result.entries[0];
        assert_eq!(entry.id, "urn:entry:1");
        assert_eq!(entry.title, "Budget blowout");
        assert_eq!(entry.link.as_str(), "https://news.example.org/stories/1");
    }

    #[test]
    fn test_entries_without_link_are_skipped() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <item><guid>x</guid><title>No link</title></item>
  <item><guid>y</guid><title>Linked</title><link>https://example.com/y</link></item>
</channel></rss>"#;
        let result = parse_feed(rss.as_bytes(), None).unwrap();
        assert_eq!(result.skipped, 1);
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].id, "y");
    }

    #[test]
    fn test_missing_title_becomes_untitled() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <item><guid>z</guid><link>https://example.com/z</link></item>
</channel></rss>"#;
        let result = parse_feed(rss.as_bytes(), None).unwrap();
        assert_eq!(result.entries[0].title, "Untitled");
    }

    #[test]
    fn test_invalid_xml_is_error() {
        assert!(parse_feed(b"<not valid xml", None).is_err());
    }

    #[test]
    fn test_title_field_normalization() {
        assert_eq!(
            TitleField::Structured("<b>Hi</b> &amp; bye".into()).into_plain(),
            "Hi & bye"
        );
        assert_eq!(TitleField::Plain("  spaced  ".into()).into_plain(), "spaced");
        assert_eq!(TitleField::Plain("<b>kept</b>".into()).into_plain(), "<b>kept</b>");
    }

    #[test]
    fn test_plain_titles_keep_literal_markup_characters() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <item><guid>t1</guid><title>Why Vec&lt;T&gt; beats arrays</title><link>https://e.com/1</link></item>
  <item><guid>t2</guid><title>Writing &amp;lt;div&amp;gt; by hand</title><link>https://e.com/2</link></item>
</channel></rss>"#;
        let result = parse_feed(rss.as_bytes(), None).unwrap();
        assert_eq!(result.entries[0].title, "Why Vec<T> beats arrays");
        assert_eq!(result.entries[1].title, "Writing &lt;div&gt; by hand");
    }

    #[test]
    fn test_generate_guid_prefers_existing() {
        assert_eq!(generate_guid(Some(" g1 "), "u", "t", None), "g1");
    }

    #[test]
    fn test_generate_guid_hash_is_stable() {
        let a = generate_guid(None, "https://e.com/1", "T", Some(1));
        let b = generate_guid(Some("   "), "https://e.com/1", "T", Some(1));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
