//! Per-backend sync pipelines.
//!
//! Each backend module drives one account kind end to end: push pending
//! local state changes, mirror the remote folder/feed tree, then pull new
//! items. The [`sync_account`] dispatcher is the only entry point; the CLI
//! never talks to a backend client directly.

pub mod fever;
pub mod freshrss;
pub mod local;

use std::collections::HashMap;
use std::time::Instant;

use anyhow::Result;
use reqwest::Client;

use crate::storage::{Account, AccountKind, Database, Item, StatePolicy};

/// What one account sync accomplished.
#[derive(Debug, Default)]
pub struct SyncSummary {
    pub account_id: i64,
    /// Remote folders mirrored (API backends only).
    pub folders: usize,
    /// Feeds refreshed or mirrored.
    pub feeds: usize,
    /// Items not seen before.
    pub items_inserted: usize,
    /// Local read/star changes pushed upstream.
    pub marks_pushed: usize,
}

/// Runs a full sync of one account.
///
/// `force` retries local feeds that have been skipped for repeated
/// failures; API backends ignore it.
pub async fn sync_account(
    db: &Database,
    client: &Client,
    account: &Account,
    force: bool,
) -> Result<SyncSummary> {
    let started = Instant::now();
    tracing::info!(account = %account.name, kind = %account.kind, "Starting sync");

    let summary = match account.kind {
        AccountKind::Local => local::sync(db, client, account, force).await?,
        AccountKind::Fever => fever::sync(db, client, account).await?,
        AccountKind::FreshRss => freshrss::sync(db, client, account).await?,
    };

    tracing::info!(
        account = %account.name,
        elapsed_ms = started.elapsed().as_millis() as u64,
        feeds = summary.feeds,
        inserted = summary.items_inserted,
        marks_pushed = summary.marks_pushed,
        "Sync finished"
    );
    Ok(summary)
}

/// Routes wire items to their local feed rows and inserts them.
///
/// API backends return items from every subscribed feed in one stream;
/// each carries the remote id of its feed. Items whose feed is unknown
/// locally (unsubscribed between listing and pulling) are dropped with a
/// warning rather than failing the sync.
pub(crate) async fn insert_grouped_items(
    db: &Database,
    account_id: i64,
    items: Vec<Item>,
    policy: StatePolicy,
) -> Result<usize> {
    if items.is_empty() {
        return Ok(0);
    }

    let feed_ids = db.feed_ids_by_remote(account_id).await?;
    let mut grouped: HashMap<i64, Vec<Item>> = HashMap::new();
    let mut unresolved = 0usize;

    for item in items {
        let feed_id = item
            .feed_remote_id
            .as_deref()
            .and_then(|remote| feed_ids.get(remote).copied());
        match feed_id {
            Some(feed_id) => grouped.entry(feed_id).or_default().push(item),
            None => unresolved += 1,
        }
    }

    if unresolved > 0 {
        tracing::warn!(
            account_id = account_id,
            dropped = unresolved,
            "Dropping items from feeds with no local subscription"
        );
    }

    let mut inserted = 0;
    for (feed_id, batch) in grouped {
        inserted += db.upsert_items(feed_id, &batch, policy).await?;
    }
    Ok(inserted)
}
