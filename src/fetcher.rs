use std::time::Duration;

use chrono::{DateTime, Utc};
use feed_rs::parser;
use reqwest::header::{IF_MODIFIED_SINCE, LAST_MODIFIED};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

pub const USER_AGENT: &str = concat!("feedpack/", env!("CARGO_PKG_VERSION"), " (feed packer)");
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Why one subscription could not be fetched. Recorded on the subscription;
/// never fatal for the run.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(StatusCode),

    #[error("subscription file bigger than {0} bytes")]
    TooLarge(usize),

    #[error("empty response")]
    Empty,

    #[error("unable to parse feed: {0}")]
    Parse(#[from] parser::ParseFeedError),

    #[error("program \"{program}\" failed: {reason}")]
    Program { program: String, reason: String },

    #[error("program \"{program}\" changed the entry guid")]
    GuidChanged { program: String },
}

/// A feed entry on its way to the packer. This is also the JSON document
/// transform programs read and write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub guid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub link: String,
    pub published: i64,
}

/// Identity of an entry across runs.
pub fn fingerprint(guid: &str) -> u32 {
    let digest = Sha256::digest(guid.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[derive(Debug, Clone, PartialEq)]
pub struct Download {
    /// Bytes of the buffer holding the document.
    pub len: usize,
    pub last_modified: Option<String>,
}

#[derive(Clone)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeout(FETCH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client })
    }

    /// Download `url` into `buf`. `Ok(None)` means the server answered
    /// "not modified" to the conditional request.
    ///
    /// A document that fills the whole buffer is rejected, so callers size it
    /// one byte above the largest document they accept.
    pub async fn download(
        &self,
        url: &str,
        last_modified: Option<&str>,
        buf: &mut [u8],
    ) -> Result<Option<Download>, FetchError> {
        debug!("Downloading {}", url);

        let mut request = self.client.get(url);
        if let Some(since) = last_modified {
            request = request.header(IF_MODIFIED_SINCE, since);
        }

        let mut response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let len = read_into(&mut response, buf).await?;
        Ok(Some(Download { len, last_modified }))
    }
}

async fn read_into(response: &mut Response, buf: &mut [u8]) -> Result<usize, FetchError> {
    let mut filled = 0;
    while filled < buf.len() {
        let Some(chunk) = response.chunk().await? else {
            break;
        };
        let n = chunk.len().min(buf.len() - filled);
        buf[filled..filled + n].copy_from_slice(&chunk[..n]);
        filled += n;
    }

    if filled == buf.len() {
        return Err(FetchError::TooLarge(buf.len().saturating_sub(1)));
    }
    if filled == 0 {
        return Err(FetchError::Empty);
    }
    Ok(filled)
}

/// Parse a feed document and return the entries newer than the one with
/// `stored` fingerprint, newest first as the feed lists them.
pub fn parse_new_items(
    data: &[u8],
    stored: Option<u32>,
    now: DateTime<Utc>,
) -> Result<Vec<FeedItem>, FetchError> {
    let parsed = parser::parse(data)?;

    let mut items = Vec::new();
    for entry in parsed.entries {
        if stored.is_some() && stored == Some(fingerprint(&entry.id)) {
            break;
        }

        let published = entry.published.or(entry.updated).unwrap_or(now);
        let title = entry.title.map(|t| t.content).unwrap_or_default();
        let summary = entry.summary.map(|s| s.content).unwrap_or_default();
        let content = entry.content.and_then(|c| c.body).unwrap_or_default();
        let (content, summary) = if content.trim().is_empty() {
            (summary, String::new())
        } else {
            (content, summary)
        };
        let link = entry
            .links
            .first()
            .map(|l| l.href.clone())
            .unwrap_or_default();

        items.push(FeedItem {
            guid: entry.id,
            title,
            content,
            summary,
            link,
            published: published.timestamp(),
        });
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const RSS: &str = r#"<?xml version="1.0"?>
        <rss version="2.0">
            <channel>
                <title>Example</title>
                <link>https://example.com</link>
                <description>Example feed</description>
                <item>
                    <guid>item-3</guid>
                    <title>Third</title>
                    <link>https://example.com/3</link>
                    <description>Summary three</description>
                    <pubDate>Wed, 03 Jan 2024 10:00:00 GMT</pubDate>
                </item>
                <item>
                    <guid>item-2</guid>
                    <title>Second</title>
                    <link>https://example.com/2</link>
                    <description>Summary two</description>
                </item>
                <item>
                    <guid>item-1</guid>
                    <title>First</title>
                    <link>https://example.com/1</link>
                    <description>Summary one</description>
                    <pubDate>Mon, 01 Jan 2024 10:00:00 GMT</pubDate>
                </item>
            </channel>
        </rss>"#;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    mod fingerprint_tests {
        use super::*;

        #[test]
        fn test_fingerprint_is_stable() {
            assert_eq!(fingerprint("item-1"), fingerprint("item-1"));
        }

        #[test]
        fn test_fingerprint_differs() {
            assert_ne!(fingerprint("item-1"), fingerprint("item-2"));
        }
    }

    mod parse_tests {
        use super::*;

        #[test]
        fn test_first_fetch_returns_everything_in_feed_order() {
            let items = parse_new_items(RSS.as_bytes(), None, now()).unwrap();
            let guids: Vec<_> = items.iter().map(|i| i.guid.as_str()).collect();
            assert_eq!(guids, vec!["item-3", "item-2", "item-1"]);
        }

        #[test]
        fn test_stops_at_stored_fingerprint() {
            let stored = Some(fingerprint("item-2"));
            let items = parse_new_items(RSS.as_bytes(), stored, now()).unwrap();
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].guid, "item-3");
        }

        #[test]
        fn test_unchanged_feed_yields_nothing() {
            let first = parse_new_items(RSS.as_bytes(), None, now()).unwrap();
            let stored = Some(fingerprint(&first[0].guid));
            let again = parse_new_items(RSS.as_bytes(), stored, now()).unwrap();
            assert!(again.is_empty());
        }

        #[test]
        fn test_unknown_fingerprint_returns_everything() {
            let items = parse_new_items(RSS.as_bytes(), Some(fingerprint("gone")), now()).unwrap();
            assert_eq!(items.len(), 3);
        }

        #[test]
        fn test_missing_date_uses_fetch_time() {
            let items = parse_new_items(RSS.as_bytes(), None, now()).unwrap();
            assert_eq!(items[1].published, now().timestamp());
            assert_eq!(
                items[0].published,
                Utc.with_ymd_and_hms(2024, 1, 3, 10, 0, 0).unwrap().timestamp()
            );
        }

        #[test]
        fn test_empty_content_falls_back_to_summary() {
            let items = parse_new_items(RSS.as_bytes(), None, now()).unwrap();
            assert_eq!(items[0].content, "Summary three");
            assert_eq!(items[0].summary, "");
            assert_eq!(items[0].link, "https://example.com/3");
            assert_eq!(items[0].title, "Third");
        }

        #[test]
        fn test_content_kept_when_present() {
            let atom = r#"<?xml version="1.0" encoding="utf-8"?>
                <feed xmlns="http://www.w3.org/2005/Atom">
                    <title>Atom</title>
                    <id>urn:feed</id>
                    <updated>2024-01-01T00:00:00Z</updated>
                    <entry>
                        <id>urn:entry:1</id>
                        <title>Entry</title>
                        <link href="https://example.com/e1"/>
                        <updated>2024-01-01T00:00:00Z</updated>
                        <summary>Short</summary>
                        <content type="html">&lt;p&gt;Long&lt;/p&gt;</content>
                    </entry>
                </feed>"#;

            let items = parse_new_items(atom.as_bytes(), None, now()).unwrap();
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].content, "<p>Long</p>");
            assert_eq!(items[0].summary, "Short");
        }

        #[test]
        fn test_garbage_is_a_parse_error() {
            let result = parse_new_items(b"<html>not a feed</html>", None, now());
            assert!(matches!(result, Err(FetchError::Parse(_))));
        }
    }

    #[test]
    fn test_item_json_shape() {
        let item = FeedItem {
            guid: "g".to_string(),
            title: "t".to_string(),
            content: "c".to_string(),
            summary: String::new(),
            link: "l".to_string(),
            published: 5,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["guid"], "g");
        assert_eq!(json["published"], 5);

        let parsed: FeedItem = serde_json::from_str(r#"{"guid":"g","published":1}"#).unwrap();
        assert_eq!(parsed.title, "");
    }
}
