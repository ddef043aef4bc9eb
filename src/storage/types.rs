use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the application has locked the database
    #[error("Another instance of millrace appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Accounts
// ============================================================================

/// Which backend protocol an account speaks.
///
/// Stored as lowercase text in the `accounts.kind` column and accepted in the
/// same form from the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Deserialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    /// Plain RSS/Atom feeds fetched directly over HTTP.
    Local,
    /// A server implementing the Fever API.
    Fever,
    /// FreshRSS, or any server implementing the Google Reader API dialect.
    FreshRss,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Local => "local",
            AccountKind::Fever => "fever",
            AccountKind::FreshRss => "freshrss",
        }
    }

    /// Whether read/starred state for this backend lives in the `item_states`
    /// table rather than on the item rows themselves.
    ///
    /// Fever reports state as separate id lists that are reconciled after
    /// items are fetched, so its state is kept per `(remote_id, account_id)`
    /// and joined in at query time.
    pub fn separate_state(&self) -> bool {
        matches!(self, AccountKind::Fever)
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An account row: one sync source plus its credentials and watermark.
///
/// `last_modified` is the sync watermark: the highest Fever item id seen, or
/// the epoch-second start of the last FreshRSS sync. Zero means never synced.
#[derive(Clone, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub kind: AccountKind,
    pub url: Option<String>,
    pub login: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub write_token: Option<String>,
    pub last_modified: i64,
}

// Credentials stay out of logs and panics.
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field(
                "write_token",
                &self.write_token.as_ref().map(|_| "<redacted>"),
            )
            .field("last_modified", &self.last_modified)
            .finish()
    }
}

// ============================================================================
// Folders and Feeds
// ============================================================================

/// A folder row. `remote_id` is set for folders mirrored from a remote
/// backend and `None` for locally created ones.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Folder {
    pub id: i64,
    pub name: String,
    pub remote_id: Option<String>,
    pub account_id: i64,
}

/// A feed row.
///
/// `unread_count` is not a table column; list queries project it in and
/// plain selects leave it at zero.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub name: String,
    pub url: Option<String>,
    pub site_url: Option<String>,
    pub remote_id: Option<String>,
    pub folder_id: Option<i64>,
    pub account_id: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub error: Option<String>,
    pub failure_count: i64,
    #[sqlx(default)]
    pub unread_count: i64,
}

/// A folder as reported by a remote backend, before it has a local row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub remote_id: String,
    pub name: String,
}

/// A feed as reported by a remote backend.
///
/// `folder_remote_id` refers to a [`RemoteFolder::remote_id`] and is resolved
/// to a local `folder_id` at upsert time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFeed {
    pub remote_id: String,
    pub name: String,
    pub url: Option<String>,
    pub site_url: Option<String>,
    pub folder_remote_id: Option<String>,
}

// ============================================================================
// Items
// ============================================================================

/// The canonical item every adapter normalizes into.
///
/// Invariants are enforced at parse time: `remote_id` and `title` are
/// non-empty, and `pub_date` is a valid timestamp (epoch zero when the wire
/// payload carried none). An `Item` is immutable once built; state changes
/// happen on the stored row, never on this struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Backend-scoped identifier. Fever numeric ids are carried as their
    /// decimal string form.
    pub remote_id: String,
    /// Remote id of the owning feed, for backends that report one.
    /// Local items are tied to a feed directly and leave this `None`.
    pub feed_remote_id: Option<String>,
    pub title: String,
    pub author: Option<String>,
    pub content: Option<String>,
    pub link: Option<String>,
    pub is_read: bool,
    pub is_starred: bool,
    pub pub_date: DateTime<Utc>,
}

/// How a batch insert treats items that already exist locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatePolicy {
    /// Existing rows are left untouched; only new items are inserted.
    /// Used by local accounts and Fever, whose state arrives separately.
    Preserve,
    /// Wire read/starred flags overwrite existing rows, except where a local
    /// change is still waiting to be pushed. Used by FreshRSS.
    Reconcile,
}

/// Read/starred state for one remote id, as rebuilt from a backend's
/// unread/saved id lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemState {
    pub remote_id: String,
    pub read: bool,
    pub starred: bool,
}

/// One row of the item list projection built by
/// [`build_items_query`](crate::storage::build_items_query).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ItemRow {
    pub id: i64,
    pub remote_id: String,
    pub feed_id: i64,
    pub title: String,
    pub author: Option<String>,
    pub content: Option<String>,
    pub link: Option<String>,
    /// Publication time in epoch seconds, as stored.
    pub pub_date: i64,
    pub read: bool,
    pub starred: bool,
    pub feed_name: String,
    pub account_id: i64,
    pub folder_id: Option<i64>,
    pub folder_name: Option<String>,
}

impl ItemRow {
    /// Publication time as a UTC timestamp, `None` if the stored value is
    /// out of chrono's range.
    pub fn pub_date_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.pub_date, 0)
    }
}
