use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another instance of
    /// millrace has the database locked (SQLITE_BUSY, SQLITE_LOCKED,
    /// SQLITE_CANTOPEN). Returns `DatabaseError::Other` for other database
    /// errors.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // The database holds account credentials, so the file must never be
        // world-readable. Permissions are fixed before pool creation; a new
        // file is pre-created with mode 0600 so there is no window where it
        // exists with default umask permissions.
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "failed to set database file permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.exists() {
                    use std::os::unix::fs::OpenOptionsExt;
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // If creation fails, SQLite reports the error at connect_with.
                }
            }
        }

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks to
        // release before returning SQLITE_BUSY, which absorbs transient
        // contention between concurrent feed fetches. Setting it via
        // pragma() makes every pooled connection inherit it.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000");
        // SQLite is single-writer; 5 connections covers the concurrent
        // readers a sync pass produces (parallel fetches + list queries).
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            // Migration errors could also be lock-related
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
                || error_string.contains("sqlite_busy")
                || error_string.contains("sqlite_locked")
            {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All schema changes are wrapped in a single transaction: if any step
    /// fails the database is left in its previous consistent state. SQLite
    /// supports DDL inside transactions, and every statement uses
    /// `IF NOT EXISTS`, so re-running on an existing database is a no-op.
    async fn migrate(&self) -> Result<()> {
        // Per-connection settings, outside the transaction
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&self.pool)
            .await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                url TEXT,
                login TEXT,
                password TEXT,
                token TEXT,
                write_token TEXT,
                last_modified INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                remote_id TEXT,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                url TEXT,
                site_url TEXT,
                remote_id TEXT,
                folder_id INTEGER REFERENCES folders(id) ON DELETE SET NULL,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                etag TEXT,
                last_modified TEXT,
                error TEXT,
                failure_count INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY,
                remote_id TEXT NOT NULL,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                author TEXT,
                content TEXT,
                link TEXT,
                pub_date INTEGER NOT NULL,
                read INTEGER NOT NULL DEFAULT 0,
                starred INTEGER NOT NULL DEFAULT 0,
                read_changed INTEGER NOT NULL DEFAULT 0,
                starred_changed INTEGER NOT NULL DEFAULT 0,
                UNIQUE(feed_id, remote_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Read/starred state for backends that report state per remote id
        // rather than inline on items (Fever). Joined into the item list
        // projection for such accounts.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS item_states (
                id INTEGER PRIMARY KEY,
                remote_id TEXT NOT NULL,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                read INTEGER NOT NULL DEFAULT 0,
                starred INTEGER NOT NULL DEFAULT 0,
                UNIQUE(remote_id, account_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Remote catalogs upsert on (account_id, remote_id). Multiple NULL
        // remote_ids per account are fine for locally created rows.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_folders_account_remote ON folders(account_id, remote_id)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_feeds_account_remote ON feeds(account_id, remote_id)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feeds_account ON feeds(account_id)")
            .execute(&mut *tx)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_feed ON items(feed_id)")
            .execute(&mut *tx)
            .await?;
        // Item lists always sort on pub_date
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_pub_date ON items(pub_date DESC)")
            .execute(&mut *tx)
            .await?;
        // State rebuild and flag reconciliation look items up by remote id
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_remote ON items(remote_id)")
            .execute(&mut *tx)
            .await?;
        // Composite index for unread count aggregation in list_feeds()
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_feed_read ON items(feed_id, read)")
            .execute(&mut *tx)
            .await?;
        // Partial index over items with unpushed state changes; the push
        // phase of every remote sync scans these.
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_items_pending ON items(feed_id) WHERE read_changed = 1 OR starred_changed = 1",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
