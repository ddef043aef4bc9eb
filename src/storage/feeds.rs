use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Feed, RemoteFeed};

const BATCH_SIZE: usize = 100;

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Adds a local feed subscription. Fails if the account already
    /// subscribes to the URL.
    pub async fn insert_feed(
        &self,
        account_id: i64,
        name: &str,
        url: &str,
        folder_id: Option<i64>,
    ) -> Result<i64> {
        if self.find_feed_by_url(account_id, url).await?.is_some() {
            bail!("Already subscribed to {url}");
        }

        let result = sqlx::query(
            "INSERT INTO feeds (name, url, folder_id, account_id) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(url)
        .bind(folder_id)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Looks up a subscription by its fetch URL.
    pub async fn find_feed_by_url(&self, account_id: i64, url: &str) -> Result<Option<i64>> {
        let id =
            sqlx::query_scalar::<_, i64>("SELECT id FROM feeds WHERE account_id = ? AND url = ?")
                .bind(account_id)
                .bind(url)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id)
    }

    /// Renames a feed.
    pub async fn update_feed_name(&self, feed_id: i64, name: &str) -> Result<()> {
        sqlx::query("UPDATE feeds SET name = ? WHERE id = ?")
            .bind(name)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fills in the title and site link learned from a feed's first fetch.
    /// A hand-subscribed feed starts out named after its URL.
    pub async fn update_feed_metadata(
        &self,
        feed_id: i64,
        name: &str,
        site_url: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE feeds SET name = ?, site_url = ? WHERE id = ?")
            .bind(name)
            .bind(site_url)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All feeds for an account with their unread item counts.
    ///
    /// With `separate_state` the unread predicate comes from the
    /// `item_states` join (missing row counts as read), matching how the
    /// item list projects state for such accounts.
    pub async fn list_feeds(&self, account_id: i64, separate_state: bool) -> Result<Vec<Feed>> {
        let sql = if separate_state {
            "SELECT f.*, \
                 COUNT(CASE WHEN s.read = 0 THEN 1 END) AS unread_count \
             FROM feeds f \
             LEFT JOIN items i ON i.feed_id = f.id \
             LEFT JOIN item_states s ON s.remote_id = i.remote_id AND s.account_id = f.account_id \
             WHERE f.account_id = ? \
             GROUP BY f.id \
             ORDER BY f.name"
        } else {
            "SELECT f.*, \
                 COUNT(CASE WHEN i.read = 0 THEN 1 END) AS unread_count \
             FROM feeds f \
             LEFT JOIN items i ON i.feed_id = f.id \
             WHERE f.account_id = ? \
             GROUP BY f.id \
             ORDER BY f.name"
        };

        let feeds = sqlx::query_as::<_, Feed>(sql)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(feeds)
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    /// Mirrors a backend's feed catalog, resolving each feed's folder
    /// through `folder_map` (remote folder id to local row id). Feeds the
    /// backend stopped reporting are deleted along with their items.
    pub async fn upsert_remote_feeds(
        &self,
        account_id: i64,
        feeds: &[RemoteFeed],
        folder_map: &HashMap<String, i64>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for chunk in feeds.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO feeds (name, url, site_url, remote_id, folder_id, account_id) ",
            );
            builder.push_values(chunk, |mut b, feed| {
                let folder_id = feed
                    .folder_remote_id
                    .as_deref()
                    .and_then(|rid| folder_map.get(rid))
                    .copied();
                b.push_bind(&feed.name)
                    .push_bind(&feed.url)
                    .push_bind(&feed.site_url)
                    .push_bind(&feed.remote_id)
                    .push_bind(folder_id)
                    .push_bind(account_id);
            });
            builder.push(
                " ON CONFLICT(account_id, remote_id) DO UPDATE SET \
                 name = excluded.name, url = excluded.url, \
                 site_url = excluded.site_url, folder_id = excluded.folder_id",
            );
            builder.build().execute(&mut *tx).await?;
        }

        let keep: HashSet<&str> = feeds.iter().map(|f| f.remote_id.as_str()).collect();
        let existing = sqlx::query_scalar::<_, String>(
            "SELECT remote_id FROM feeds WHERE account_id = ? AND remote_id IS NOT NULL",
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
                QueryBuilder::new("DELETE FROM feeds WHERE account_id = ");
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

    /// Map from feed remote id to local row id for one account.
    pub async fn feed_ids_by_remote(&self, account_id: i64) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT remote_id, id FROM feeds WHERE account_id = ? AND remote_id IS NOT NULL",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Records a successful fetch: clears the error state and stores the
    /// conditional-request validators for next time.
    pub async fn record_feed_success(
        &self,
        feed_id: i64,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE feeds SET error = NULL, failure_count = 0, etag = ?, last_modified = ? \
             WHERE id = ?",
        )
        .bind(etag)
        .bind(last_modified)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a failed fetch and returns the new consecutive-failure count.
    pub async fn record_feed_failure(&self, feed_id: i64, error: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "UPDATE feeds SET error = ?, failure_count = failure_count + 1 \
             WHERE id = ? RETURNING failure_count",
        )
        .bind(error)
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::AccountKind;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn remote_feed(id: &str, name: &str, folder: Option<&str>) -> RemoteFeed {
        RemoteFeed {
            remote_id: id.to_owned(),
            name: name.to_owned(),
            url: Some(format!("https://example.com/{id}.xml")),
            site_url: None,
            folder_remote_id: folder.map(str::to_owned),
        }
    }

    #[tokio::test]
    async fn insert_feed_rejects_duplicate_url() {
        let db = test_db().await;
        let account_id = db
            .insert_account("test", AccountKind::Local, None, None, None)
            .await
            .unwrap();

        db.insert_feed(account_id, "Example", "https://example.com/rss", None)
            .await
            .unwrap();
        let err = db
            .insert_feed(account_id, "Example again", "https://example.com/rss", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Already subscribed"));
    }

    #[tokio::test]
    async fn remote_feeds_resolve_folders_and_prune() {
        let db = test_db().await;
        let account_id = db
            .insert_account("reader", AccountKind::FreshRss, None, None, None)
            .await
            .unwrap();

        db.upsert_remote_folders(
            account_id,
            &[crate::storage::types::RemoteFolder {
                remote_id: "user/-/label/Tech".into(),
                name: "Tech".into(),
            }],
        )
        .await
        .unwrap();
        let folder_map = db.folder_ids_by_remote(account_id).await.unwrap();

        db.upsert_remote_feeds(
            account_id,
            &[
                remote_feed("feed/1", "One", Some("user/-/label/Tech")),
                remote_feed("feed/2", "Two", None),
            ],
            &folder_map,
        )
        .await
        .unwrap();

        let feeds = db.list_feeds(account_id, false).await.unwrap();
        assert_eq!(feeds.len(), 2);
        let one = feeds.iter().find(|f| f.name == "One").unwrap();
        assert_eq!(one.folder_id, Some(folder_map["user/-/label/Tech"]));

        // Unsubscribed upstream
        db.upsert_remote_feeds(
            account_id,
            &[remote_feed("feed/1", "One", Some("user/-/label/Tech"))],
            &folder_map,
        )
        .await
        .unwrap();
        let feeds = db.list_feeds(account_id, false).await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].remote_id.as_deref(), Some("feed/1"));
    }

    #[tokio::test]
    async fn fetch_bookkeeping_round_trips() {
        let db = test_db().await;
        let account_id = db
            .insert_account("test", AccountKind::Local, None, None, None)
            .await
            .unwrap();
        let feed_id = db
            .insert_feed(account_id, "Example", "https://example.com/rss", None)
            .await
            .unwrap();

        assert_eq!(db.record_feed_failure(feed_id, "timeout").await.unwrap(), 1);
        assert_eq!(db.record_feed_failure(feed_id, "HTTP 500").await.unwrap(), 2);

        let feed = db.get_feed(feed_id).await.unwrap().unwrap();
        assert_eq!(feed.failure_count, 2);
        assert_eq!(feed.error.as_deref(), Some("HTTP 500"));

        db.record_feed_success(feed_id, Some("\"etag-1\""), None)
            .await
            .unwrap();
        let feed = db.get_feed(feed_id).await.unwrap().unwrap();
        assert_eq!(feed.failure_count, 0);
        assert!(feed.error.is_none());
        assert_eq!(feed.etag.as_deref(), Some("\"etag-1\""));
    }
}
