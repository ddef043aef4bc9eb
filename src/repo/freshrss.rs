//! Sync pipeline for FreshRSS accounts.
//!
//! State rides along with the items here: the category sentinels on each
//! pulled item carry read/starred, so there is no separate state table to
//! rebuild. Pending local changes go up first as batched `edit-tag` calls,
//! and the watermark is the wall-clock start of the sync rather than an
//! item id.

use anyhow::Result;
use chrono::Utc;
use reqwest::Client;

use crate::api::freshrss::adapters::{STATE_READ, STATE_STARRED};
use crate::api::freshrss::FreshRssClient;
use crate::api::SyncError;
use crate::repo::{insert_grouped_items, SyncSummary};
use crate::storage::{Account, Database, StatePolicy};

/// How many items one stream call asks for. Large enough that the initial
/// backlog fits in a single page on typical instances.
const ITEM_PAGE_SIZE: usize = 1000;

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

    let mut api = FreshRssClient::new(client.clone(), url);

    // Reuse the stored session token, logging in again when it is missing
    // or no longer honored. user-info doubles as the token probe.
    let user = match &account.token {
        Some(token) => {
            api.set_token(token.clone());
            match api.user_info().await {
                Ok(user) => user,
                Err(SyncError::HttpStatus(401) | SyncError::Auth(_)) => {
                    let token = api.login(login, password).await?;
                    db.update_account_token(account.id, &token).await?;
                    api.user_info().await?
                }
                Err(e) => return Err(e.into()),
            }
        }
        None => {
            let token = api.login(login, password).await?;
            db.update_account_token(account.id, &token).await?;
            api.user_info().await?
        }
    };
    if user.user_name != account.name {
        db.update_account_name(account.id, &user.user_name).await?;
    }

    // The write token is short-lived; fetch a fresh one every sync.
    let write_token = api.fetch_write_token().await?;
    db.update_account_write_token(account.id, &write_token)
        .await?;

    let mut summary = SyncSummary {
        account_id: account.id,
        ..SyncSummary::default()
    };

    summary.marks_pushed = push_marks(db, &api, account).await?;

    let folders = api.folders().await?;
    summary.folders = folders.len();
    db.upsert_remote_folders(account.id, &folders).await?;

    let feeds = api.feeds().await?;
    summary.feeds = feeds.len();
    let folder_map = db.folder_ids_by_remote(account.id).await?;
    db.upsert_remote_feeds(account.id, &feeds, &folder_map)
        .await?;

    // Taking the watermark before the pull leans toward re-fetching an
    // item over missing one crawled mid-sync; re-inserts are ignored.
    let sync_start = Utc::now().timestamp();

    let items = if account.last_modified == 0 {
        // First sync. The reading-list page misses starred items older
        // than the page, so pull the starred stream too; overlap
        // collapses on insert.
        let mut items = api.items(ITEM_PAGE_SIZE, None).await?;
        items.extend(api.starred_items(ITEM_PAGE_SIZE).await?);
        items
    } else {
        api.items(ITEM_PAGE_SIZE, Some(account.last_modified))
            .await?
    };

    summary.items_inserted =
        insert_grouped_items(db, account.id, items, StatePolicy::Reconcile).await?;
    db.update_account_last_modified(account.id, sync_start)
        .await?;

    Ok(summary)
}

/// Pushes pending local changes as four batched `edit-tag` calls, then
/// clears the pending flags.
async fn push_marks(db: &Database, api: &FreshRssClient, account: &Account) -> Result<usize> {
    let (read, unread) = split_flagged(db.read_changes(account).await?);
    let (starred, unstarred) = split_flagged(db.starred_changes(account).await?);
    let pushed = read.len() + unread.len() + starred.len() + unstarred.len();

    api.edit_tags(&read, Some(STATE_READ), None).await?;
    api.edit_tags(&unread, None, Some(STATE_READ)).await?;
    api.edit_tags(&starred, Some(STATE_STARRED), None).await?;
    api.edit_tags(&unstarred, None, Some(STATE_STARRED)).await?;

    db.reset_sync_flags(account.id).await?;
    Ok(pushed)
}

/// Splits pending changes into the ids whose flag went on and those whose
/// flag went off.
fn split_flagged(changes: Vec<(String, bool)>) -> (Vec<String>, Vec<String>) {
    let mut on = Vec::new();
    let mut off = Vec::new();
    for (remote_id, flag) in changes {
        if flag {
            on.push(remote_id);
        } else {
            off.push(remote_id);
        }
    }
    (on, off)
}
