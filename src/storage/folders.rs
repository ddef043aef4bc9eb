use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Folder, RemoteFolder};

/// Maximum folder name length in characters
const MAX_NAME_LENGTH: usize = 200;

const BATCH_SIZE: usize = 100;

impl Database {
    // ========================================================================
    // Folder Operations
    // ========================================================================

    /// Strips control characters and trims whitespace; rejects names that
    /// end up empty or too long. Folder names come from config files, OPML
    /// imports, and remote servers, none of which are trusted.
    fn sanitize_folder_name(name: &str) -> Result<String> {
        let cleaned: String = name.chars().filter(|c| !c.is_control()).collect();
        let trimmed = cleaned.trim();

        if trimmed.is_empty() {
            bail!("Folder name cannot be empty");
        }
        if trimmed.chars().count() > MAX_NAME_LENGTH {
            bail!("Folder name too long (max {MAX_NAME_LENGTH} characters)");
        }
        Ok(trimmed.to_owned())
    }

    /// Returns the id of the named folder, creating it if needed.
    /// Lookup is by name among the account's local folders, which makes
    /// OPML re-imports idempotent.
    pub async fn ensure_folder(&self, account_id: i64, name: &str) -> Result<i64> {
        let clean_name = Self::sanitize_folder_name(name)?;

        if let Some(folder) = self.find_folder_by_name(account_id, &clean_name).await? {
            return Ok(folder.id);
        }

        let result = sqlx::query("INSERT INTO folders (name, account_id) VALUES (?, ?)")
            .bind(&clean_name)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn find_folder_by_name(
        &self,
        account_id: i64,
        name: &str,
    ) -> Result<Option<Folder>> {
        let folder = sqlx::query_as::<_, Folder>(
            "SELECT * FROM folders WHERE account_id = ? AND name = ?",
        )
        .bind(account_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(folder)
    }

    pub async fn list_folders(&self, account_id: i64) -> Result<Vec<Folder>> {
        let folders = sqlx::query_as::<_, Folder>(
            "SELECT * FROM folders WHERE account_id = ? ORDER BY name",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(folders)
    }

    /// Mirrors a backend's folder catalog: upserts every reported folder by
    /// remote id and deletes remote folders the backend no longer reports.
    /// Locally created folders (`remote_id IS NULL`) are never pruned.
    pub async fn upsert_remote_folders(
        &self,
        account_id: i64,
        folders: &[RemoteFolder],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for chunk in folders.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT INTO folders (name, remote_id, account_id) ");
            builder.push_values(chunk, |mut b, folder| {
                b.push_bind(&folder.name)
                    .push_bind(&folder.remote_id)
                    .push_bind(account_id);
            });
            builder.push(
                " ON CONFLICT(account_id, remote_id) DO UPDATE SET name = excluded.name",
            );
            builder.build().execute(&mut *tx).await?;
        }

        // Prune by set difference rather than NOT IN so a large catalog
        // cannot blow SQLite's bind parameter limit.
        let keep: HashSet<&str> = folders.iter().map(|f| f.remote_id.as_str()).collect();
        let existing = sqlx::query_scalar::<_, String>(
            "SELECT remote_id FROM folders WHERE account_id = ? AND remote_id IS NOT NULL",
        )
        .bind(account_id)
        .fetch_all(&mut *tx)
        .await?;
        let stale: Vec<String> = existing
            .into_iter()
            .filter(|id| !keep.contains(id.as_str()))
            .collect();

        for chunk in stale.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("DELETE FROM folders WHERE account_id = ");
            builder.push_bind(account_id);
            builder.push(" AND remote_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Map from folder remote id to local row id for one account.
    pub async fn folder_ids_by_remote(&self, account_id: i64) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT remote_id, id FROM folders WHERE account_id = ? AND remote_id IS NOT NULL",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}
