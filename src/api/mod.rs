//! Protocol clients and wire-format adapters.
//!
//! Each backend gets a submodule with two layers: a thin HTTP client that
//! owns endpoints, credentials, and response size limits, and a pure
//! `adapters` module that turns raw bodies into canonical
//! [`Item`](crate::storage::Item) values (plus folder/feed catalogs). The
//! adapters never touch the network or the database, which is what keeps
//! them unit-testable against byte slices.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use thiserror::Error;

use crate::storage::Item;

pub mod fever;
pub mod freshrss;
pub mod local;

/// Per-request timeout shared by all backends.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Response body cap (feeds and API responses alike).
pub(crate) const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024; // 10MB

// ============================================================================
// Errors
// ============================================================================

/// A malformed payload: invalid JSON or XML, a missing required key, or an
/// item violating the canonical invariants (empty id or title).
///
/// One message-carrying type for every adapter; wire-format detail lives in
/// the message. A parse failure discards the whole response, partial results
/// are never returned.
#[derive(Debug, Error)]
#[error("Parse error: {0}")]
pub struct ParseError(pub(crate) String);

impl ParseError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

/// Errors a sync pass can hit, from the socket up to the database write.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the 30-second timeout
    #[error("Request timed out")]
    Timeout,
    /// The backend rejected our credentials or token
    #[error("Authentication failed: {0}")]
    Auth(String),
    /// The account row lacks a credential this backend requires
    #[error("Account is missing {0}")]
    MissingCredentials(&'static str),
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Database operation failed while storing sync results
    #[error("Database error: {0}")]
    Database(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Fails non-2xx responses before anyone reads the body.
pub(crate) fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(SyncError::HttpStatus(status.as_u16()))
    }
}

/// Reads a response body, enforcing the size cap while streaming.
///
/// The Content-Length header gives a fast reject for oversized bodies, but
/// the cap is enforced on actual bytes too since the header is optional and
/// unverified. A body shorter than its declared Content-Length is reported
/// as [`SyncError::IncompleteResponse`] so callers can retry.
pub(crate) async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, SyncError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(SyncError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(SyncError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(SyncError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(SyncError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

// ============================================================================
// Item Draft
// ============================================================================

/// Mutable accumulator the adapters fill while walking an item object.
///
/// [`freeze`](ItemDraft::freeze) validates and converts it into the
/// immutable canonical [`Item`]; nothing downstream ever sees a draft.
#[derive(Debug, Default)]
pub(crate) struct ItemDraft {
    pub remote_id: Option<String>,
    pub feed_remote_id: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
    pub link: Option<String>,
    pub is_read: bool,
    pub is_starred: bool,
    pub pub_date: Option<DateTime<Utc>>,
}

impl ItemDraft {
    /// Validates the required fields and produces the canonical item.
    ///
    /// `remote_id` and `title` must be present and non-empty. A missing
    /// publication date becomes the epoch, which sorts such items last
    /// without inventing a fake recency.
    pub(crate) fn freeze(self) -> Result<Item, String> {
        let remote_id = match self.remote_id {
            Some(id) if !id.is_empty() => id,
            _ => return Err("item is missing a non-empty id".to_owned()),
        };
        let title = match self.title {
            Some(title) if !title.is_empty() => title,
            _ => return Err(format!("item {remote_id} is missing a non-empty title")),
        };
        Ok(Item {
            remote_id,
            feed_remote_id: self.feed_remote_id,
            title,
            author: self.author,
            content: self.content,
            link: self.link,
            is_read: self.is_read,
            is_starred: self.is_starred,
            pub_date: self.pub_date.unwrap_or(DateTime::UNIX_EPOCH),
        })
    }
}

/// Epoch seconds to UTC, with the out-of-range error spelled out.
pub(crate) fn epoch_to_datetime(secs: i64) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| format!("timestamp out of range: {secs}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_requires_id_and_title() {
        let draft = ItemDraft {
            remote_id: Some("42".into()),
            title: Some("Hello".into()),
            ..Default::default()
        };
        let item = draft.freeze().unwrap();
        assert_eq!(item.remote_id, "42");
        assert_eq!(item.pub_date, DateTime::UNIX_EPOCH);

        let missing_id = ItemDraft {
            title: Some("Hello".into()),
            ..Default::default()
        };
        assert!(missing_id.freeze().is_err());

        let empty_title = ItemDraft {
            remote_id: Some("42".into()),
            title: Some(String::new()),
            ..Default::default()
        };
        assert!(empty_title.freeze().is_err());
    }

    #[test]
    fn epoch_conversion_bounds() {
        assert_eq!(epoch_to_datetime(0).unwrap(), DateTime::UNIX_EPOCH);
        assert!(epoch_to_datetime(1_700_000_000).is_ok());
        assert!(epoch_to_datetime(i64::MAX).is_err());
    }
}
