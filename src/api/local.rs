//! Parser for directly-fetched RSS/Atom/JSON feeds.
//!
//! Unlike the API backends, a bad entry here never poisons the batch: a
//! titleless entry is skipped and counted, and an entry without a usable id
//! gets a stable hash-derived one. Entries with no timestamp at all are
//! stamped with the fetch time so they sort near the top once, instead of
//! sinking to 1970.

use chrono::Utc;
use feed_rs::parser;
use sha2::{Digest, Sha256};

use crate::api::ParseError;
use crate::storage::Item;

/// The outcome of parsing one feed document.
#[derive(Debug)]
pub struct ParsedFeed {
    /// Feed-level title, used to name a feed after its first fetch.
    pub title: Option<String>,
    /// Feed-level website link.
    pub site_url: Option<String>,
    pub items: Vec<Item>,
    /// Entries dropped for having no title.
    pub skipped: usize,
}

pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let feed = parser::parse(bytes).map_err(|e| ParseError::new(e.to_string()))?;

    let title = feed.title.map(|t| t.content).filter(|t| !t.is_empty());
    let site_url = feed.links.first().map(|l| l.href.clone());

    let mut items = Vec::with_capacity(feed.entries.len());
    let mut skipped = 0;

    for entry in feed.entries {
        let Some(title) = entry.title.map(|t| t.content).filter(|t| !t.trim().is_empty())
        else {
            skipped += 1;
            continue;
        };

        let link = entry.links.first().map(|l| l.href.clone());
        let pub_date = entry.published.or(entry.updated).unwrap_or_else(Utc::now);
        let author = entry
            .authors
            .into_iter()
            .map(|p| p.name)
            .find(|n| !n.is_empty());
        let content = entry
            .content
            .and_then(|c| c.body)
            .or_else(|| entry.summary.map(|s| s.content));

        let existing_id = if entry.id.is_empty() {
            None
        } else {
            Some(entry.id.as_str())
        };
        let remote_id = stable_guid(existing_id, link.as_deref(), &title, pub_date.timestamp());

        items.push(Item {
            remote_id,
            feed_remote_id: None,
            title,
            author,
            content,
            link,
            is_read: false,
            is_starred: false,
            pub_date,
        });
    }

    Ok(ParsedFeed {
        title,
        site_url,
        items,
        skipped,
    })
}

/// Returns the entry's own id when present, otherwise a SHA-256 over the
/// fields that identify the entry. Feeds that omit guids get stable ids as
/// long as they do not rewrite link, title, and date all at once.
fn stable_guid(existing: Option<&str>, link: Option<&str>, title: &str, published: i64) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!("{}|{}|{}", link.unwrap_or(""), title, published);
    let hash = Sha256::digest(input.as_bytes());
    format!("{hash:x}")
}
