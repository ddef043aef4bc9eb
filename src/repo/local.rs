//! Sync pipeline for accounts whose feeds are fetched directly.
//!
//! Feeds are fetched concurrently with a bounded pool, each request
//! carrying the validators (`ETag`, `Last-Modified`) captured on the last
//! success so unchanged feeds cost a 304 and no body. Transient failures
//! (429, 5xx, truncated bodies) are retried with exponential backoff;
//! persistent failures increment a per-feed counter that takes the feed
//! out of rotation until a forced sync.

use std::time::Duration;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, Response, StatusCode};
use tokio::time::timeout;

use crate::api::local::parse_feed;
use crate::api::{read_limited_bytes, SyncError, MAX_RESPONSE_SIZE, REQUEST_TIMEOUT};
use crate::repo::SyncSummary;
use crate::storage::{Account, Database, Feed, StatePolicy};

const MAX_CONCURRENT_FETCHES: usize = 10;
const MAX_RETRIES: u32 = 3;
/// Consecutive failures after which a feed is skipped.
pub const FAILURE_SKIP_THRESHOLD: i64 = 5;

pub(crate) async fn sync(
    db: &Database,
    client: &Client,
    account: &Account,
    force: bool,
) -> Result<SyncSummary> {
    let feeds = db.list_feeds(account.id, false).await?;

    // Rows without a fetch URL cannot be polled; local subscriptions always
    // store one, so this only drops malformed rows.
    let mut active: Vec<(String, Feed)> = Vec::new();
    let mut skipped = 0usize;
    for feed in feeds {
        let Some(url) = feed.url.clone() else {
            continue;
        };
        if !force && feed.failure_count >= FAILURE_SKIP_THRESHOLD {
            skipped += 1;
            continue;
        }
        active.push((url, feed));
    }
    if skipped > 0 {
        tracing::info!(
            skipped = skipped,
            threshold = FAILURE_SKIP_THRESHOLD,
            "Skipping repeatedly failing feeds (sync --force retries them)"
        );
    }

    let mut summary = SyncSummary {
        account_id: account.id,
        ..SyncSummary::default()
    };
    if active.is_empty() {
        return Ok(summary);
    }

    let results: Vec<(Feed, String, Result<usize, SyncError>)> = stream::iter(active)
        .map(|(url, feed)| {
            let db = db.clone();
            let client = client.clone();
            async move {
                let result = refresh_feed(&db, &client, &feed, &url).await;
                (feed, url, result)
            }
        })
        .buffer_unordered(MAX_CONCURRENT_FETCHES)
        .collect()
        .await;

    for (feed, url, result) in results {
        match result {
            Ok(inserted) => {
                summary.feeds += 1;
                summary.items_inserted += inserted;
            }
            Err(e) => {
                tracing::warn!(feed = %url, error = %e, "Feed refresh failed");
                match db.record_feed_failure(feed.id, &e.to_string()).await {
                    Ok(failures) if failures >= FAILURE_SKIP_THRESHOLD => {
                        tracing::info!(
                            feed = %url,
                            failures = failures,
                            "Feed will be skipped until a forced sync"
                        );
                    }
                    Ok(_) => {}
                    Err(db_err) => {
                        tracing::warn!(feed_id = feed.id, error = %db_err, "Failed to record feed failure");
                    }
                }
            }
        }
    }

    Ok(summary)
}

enum FetchOutcome {
    NotModified,
    Fetched {
        bytes: Vec<u8>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

async fn refresh_feed(
    db: &Database,
    client: &Client,
    feed: &Feed,
    url: &str,
) -> Result<usize, SyncError> {
    let db_err = |e: anyhow::Error| SyncError::Database(e.to_string());

    match fetch_feed(client, feed, url).await? {
        FetchOutcome::NotModified => {
            // Keep the validators that just proved themselves.
            db.record_feed_success(feed.id, feed.etag.as_deref(), feed.last_modified.as_deref())
                .await
                .map_err(db_err)?;
            Ok(0)
        }
        FetchOutcome::Fetched {
            bytes,
            etag,
            last_modified,
        } => {
            let parsed = parse_feed(&bytes)?;
            if parsed.skipped > 0 {
                tracing::warn!(
                    feed = %url,
                    skipped = parsed.skipped,
                    "Skipped entries without a title"
                );
            }

            let inserted = db
                .upsert_items(feed.id, &parsed.items, StatePolicy::Preserve)
                .await
                .map_err(db_err)?;

            // A feed still named after its URL has never been fetched;
            // adopt the title and site link it declares for itself.
            if feed.name == url {
                let name = parsed.title.as_deref().unwrap_or(&feed.name);
                db.update_feed_metadata(feed.id, name, parsed.site_url.as_deref())
                    .await
                    .map_err(db_err)?;
            }

            db.record_feed_success(feed.id, etag.as_deref(), last_modified.as_deref())
                .await
                .map_err(db_err)?;
            Ok(inserted)
        }
    }
}

async fn fetch_feed(client: &Client, feed: &Feed, url: &str) -> Result<FetchOutcome, SyncError> {
    let mut retries = 0u32;

    loop {
        let mut request = client.get(url);
        if let Some(etag) = &feed.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(modified) = &feed.last_modified {
            request = request.header(IF_MODIFIED_SINCE, modified);
        }

        let response = timeout(REQUEST_TIMEOUT, request.send())
            .await
            .map_err(|_| SyncError::Timeout)??;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            if retries >= MAX_RETRIES {
                return Err(SyncError::RateLimited(MAX_RETRIES));
            }
            backoff(url, "rate limited", retries).await;
            retries += 1;
            continue;
        }

        if status.is_server_error() {
            if retries >= MAX_RETRIES {
                return Err(SyncError::HttpStatus(status.as_u16()));
            }
            backoff(url, "server error", retries).await;
            retries += 1;
            continue;
        }

        if !status.is_success() {
            return Err(SyncError::HttpStatus(status.as_u16()));
        }

        // Capture validators before the body consumes the response.
        let etag = header_string(&response, ETAG);
        let last_modified = header_string(&response, LAST_MODIFIED);

        match read_limited_bytes(response, MAX_RESPONSE_SIZE).await {
            Ok(bytes) => {
                return Ok(FetchOutcome::Fetched {
                    bytes,
                    etag,
                    last_modified,
                })
            }
            Err(SyncError::IncompleteResponse { expected, received }) => {
                if retries >= MAX_RETRIES {
                    return Err(SyncError::IncompleteResponse { expected, received });
                }
                backoff(url, "incomplete body", retries).await;
                retries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn backoff(url: &str, reason: &str, retries: u32) {
    let delay_secs = 2u64.pow(retries); // 2s, 4s, 8s
    tracing::warn!(
        feed = %url,
        reason = reason,
        retry = retries,
        delay_secs = delay_secs,
        "Retrying feed fetch"
    );
    tokio::time::sleep(Duration::from_secs(delay_secs)).await;
}

fn header_string(response: &Response, name: HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AccountKind;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Wire Title</title>
    <link>https://example.com</link>
    <item><guid>1</guid><title>Test</title><pubDate>Tue, 14 Nov 2023 22:13:20 GMT</pubDate></item>
</channel></rss>"#;

    async fn setup(url: &str) -> (Database, Account, Feed) {
        let db = Database::open(":memory:").await.unwrap();
        let account_id = db
            .insert_account("Local", AccountKind::Local, None, None, None)
            .await
            .unwrap();
        let account = db.get_account(account_id).await.unwrap().unwrap();
        let feed_id = db.insert_feed(account_id, url, url, None).await.unwrap();
        let feed = db.get_feed(feed_id).await.unwrap().unwrap();
        (db, account, feed)
    }

    #[tokio::test]
    async fn refresh_inserts_items_and_adopts_feed_title() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("ETag", "\"v1\""),
            )
            .mount(&server)
            .await;

        let url = format!("{}/feed", server.uri());
        let (db, account, feed) = setup(&url).await;
        let client = Client::new();

        let summary = sync(&db, &client, &account, false).await.unwrap();
        assert_eq!(summary.items_inserted, 1);
        assert_eq!(summary.feeds, 1);

        let refreshed = db.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(refreshed.name, "Wire Title");
        assert_eq!(refreshed.site_url.as_deref(), Some("https://example.com"));
        assert_eq!(refreshed.etag.as_deref(), Some("\"v1\""));
        assert_eq!(refreshed.failure_count, 0);
    }

    #[tokio::test]
    async fn not_modified_keeps_existing_validators() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/feed", server.uri());
        let (db, account, feed) = setup(&url).await;
        db.record_feed_success(feed.id, Some("\"v1\""), None)
            .await
            .unwrap();

        let summary = sync(&db, &Client::new(), &account, false).await.unwrap();
        assert_eq!(summary.items_inserted, 0);

        let refreshed = db.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(refreshed.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn persistent_failure_counts_toward_the_skip_threshold() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = format!("{}/feed", server.uri());
        let (db, account, feed) = setup(&url).await;

        let summary = sync(&db, &Client::new(), &account, false).await.unwrap();
        assert_eq!(summary.feeds, 0);

        let failed = db.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(failed.failure_count, 1);
        assert!(failed.error.as_deref().unwrap().contains("404"));
    }

    #[tokio::test]
    async fn feeds_over_the_threshold_are_skipped_unless_forced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(1) // only the forced pass may hit the server
            .mount(&server)
            .await;

        let url = format!("{}/feed", server.uri());
        let (db, account, feed) = setup(&url).await;
        for _ in 0..FAILURE_SKIP_THRESHOLD {
            db.record_feed_failure(feed.id, "connection refused")
                .await
                .unwrap();
        }

        let skipped = sync(&db, &Client::new(), &account, false).await.unwrap();
        assert_eq!(skipped.feeds, 0);

        let forced = sync(&db, &Client::new(), &account, true).await.unwrap();
        assert_eq!(forced.feeds, 1);
        assert_eq!(
            db.get_feed(feed.id).await.unwrap().unwrap().failure_count,
            0
        );
    }
}
