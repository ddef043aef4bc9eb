//! Sync pipeline for Fever-API accounts.
//!
//! Fever has no incremental state endpoint, so a sync is four moves: push
//! pending marks item by item, mirror groups and feeds, pull items above
//! the numeric high-water mark, then rebuild the per-account state table
//! from the full unread/saved id lists.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use reqwest::Client;

use crate::api::fever::adapters::{FeedsGroup, FeverFeed};
use crate::api::fever::{FeverClient, MarkAction};
use crate::api::SyncError;
use crate::repo::{insert_grouped_items, SyncSummary};
use crate::storage::{Account, Database, ItemState, RemoteFeed, RemoteFolder, StatePolicy};

pub(crate) async fn sync(db: &Database, client: &Client, account: &Account) -> Result<SyncSummary> {
    let url = account
        .url
        .as_deref()
        .ok_or(SyncError::MissingCredentials("url"))?;
    let login = account
        .login
        .as_deref()
        .ok_or(SyncError::MissingCredentials("login"))?;
    let password = account
        .password
        .as_deref()
        .ok_or(SyncError::MissingCredentials("password"))?;

    let api = FeverClient::new(client.clone(), url, login, password);
    api.validate().await?;

    let mut summary = SyncSummary {
        account_id: account.id,
        ..SyncSummary::default()
    };

    // Push before pulling so the id lists fetched below already reflect
    // our own changes.
    summary.marks_pushed = push_marks(db, &api, account).await?;

    let groups = api.groups().await?;
    let folders: Vec<RemoteFolder> = groups
        .into_iter()
        .map(|g| RemoteFolder {
            remote_id: g.id.to_string(),
            name: g.title,
        })
        .collect();
    summary.folders = folders.len();
    db.upsert_remote_folders(account.id, &folders).await?;

    let doc = api.feeds().await?;
    let membership = membership_map(&doc.feeds_groups);
    let feeds = to_remote_feeds(doc.feeds, &membership);
    summary.feeds = feeds.len();
    let folder_map = db.folder_ids_by_remote(account.id).await?;
    db.upsert_remote_feeds(account.id, &feeds, &folder_map)
        .await?;

    let items = api.items_since(account.last_modified).await?;
    let watermark = items
        .iter()
        .filter_map(|item| item.remote_id.parse::<i64>().ok())
        .max()
        .map_or(account.last_modified, |max| max.max(account.last_modified));
    summary.items_inserted =
        insert_grouped_items(db, account.id, items, StatePolicy::Preserve).await?;
    db.update_account_last_modified(account.id, watermark)
        .await?;

    // The id lists are the authoritative state for everything we hold.
    let unread: HashSet<String> = api.unread_item_ids().await?.into_iter().collect();
    let saved: HashSet<String> = api.saved_item_ids().await?.into_iter().collect();
    let states: Vec<ItemState> = db
        .account_item_remote_ids(account.id)
        .await?
        .into_iter()
        .map(|remote_id| ItemState {
            read: !unread.contains(&remote_id),
            starred: saved.contains(&remote_id),
            remote_id,
        })
        .collect();
    db.upsert_item_states(account.id, &states).await?;

    Ok(summary)
}

/// Replays pending local read/star changes, one `mark` call each, then
/// clears the pending flags.
async fn push_marks(db: &Database, api: &FeverClient, account: &Account) -> Result<usize> {
    let mut pushed = 0;

    for (remote_id, read) in db.read_changes(account).await? {
        let action = if read {
            MarkAction::Read
        } else {
            MarkAction::Unread
        };
        api.mark_item(&remote_id, action).await?;
        pushed += 1;
    }
    for (remote_id, starred) in db.starred_changes(account).await? {
        let action = if starred {
            MarkAction::Saved
        } else {
            MarkAction::Unsaved
        };
        api.mark_item(&remote_id, action).await?;
        pushed += 1;
    }

    db.reset_sync_flags(account.id).await?;
    Ok(pushed)
}

/// Feed-to-group memberships, first listed group winning for feeds that
/// appear in several.
fn membership_map(groups: &[FeedsGroup]) -> HashMap<i64, i64> {
    let mut map = HashMap::new();
    for group in groups {
        for &feed_id in &group.feed_ids {
            map.entry(feed_id).or_insert(group.group_id);
        }
    }
    map
}

fn to_remote_feeds(feeds: Vec<FeverFeed>, membership: &HashMap<i64, i64>) -> Vec<RemoteFeed> {
    feeds
        .into_iter()
        .map(|feed| {
            let remote_id = feed.id.to_string();
            // Fever serves empty titles for feeds it could not name.
            let name = if feed.title.is_empty() {
                feed.url.clone().unwrap_or_else(|| remote_id.clone())
            } else {
                feed.title
            };
            RemoteFeed {
                folder_remote_id: membership.get(&feed.id).map(|g| g.to_string()),
                remote_id,
                name,
                url: feed.url,
                site_url: feed.site_url,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn first_listed_group_wins_for_shared_feeds() {
        let groups = vec![
            FeedsGroup {
                group_id: 1,
                feed_ids: vec![10, 11],
            },
            FeedsGroup {
                group_id: 2,
                feed_ids: vec![11, 12],
            },
        ];

        let map = membership_map(&groups);
        assert_eq!(map.get(&10), Some(&1));
        assert_eq!(map.get(&11), Some(&1));
        assert_eq!(map.get(&12), Some(&2));
    }

    #[test]
    fn untitled_feeds_fall_back_to_url_then_id() {
        let feeds = vec![
            FeverFeed {
                id: 1,
                title: String::new(),
                url: Some("https://example.com/rss".into()),
                site_url: None,
            },
            FeverFeed {
                id: 2,
                title: String::new(),
                url: None,
                site_url: None,
            },
        ];

        let remote = to_remote_feeds(feeds, &HashMap::new());
        assert_eq!(remote[0].name, "https://example.com/rss");
        assert_eq!(remote[1].name, "2");
    }
}
