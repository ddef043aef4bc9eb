use anyhow::Result;
use sqlx::{QueryBuilder, Sqlite, Transaction};

use super::schema::Database;
use super::types::{Account, AccountKind, Item, ItemRow, ItemState, StatePolicy};

/// 9 bound columns per item keeps a full chunk well under SQLite's 999
/// parameter limit.
const BATCH_SIZE: usize = 50;

impl Database {
    // ========================================================================
    // Item Operations
    // ========================================================================

    /// Inserts a batch of parsed items for a feed, returning how many were new.
    ///
    /// Uses a two-phase write: INSERT OR IGNORE (counting new rows via
    /// `changes()`, no table scan) and then, under
    /// [`StatePolicy::Reconcile`], a flag pass that folds the wire
    /// read/starred values into rows that already existed. The flag pass
    /// skips rows whose `read_changed`/`starred_changed` is set, so a state
    /// change made locally between two syncs is never clobbered before it
    /// has been pushed.
    ///
    /// Item metadata (title, content, author) is written once at first sight
    /// and not refreshed afterwards; backends treat items as immutable.
    pub async fn upsert_items(
        &self,
        feed_id: i64,
        items: &[Item],
        policy: StatePolicy,
    ) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut total_inserted: usize = 0;

        for chunk in items.chunks(BATCH_SIZE) {
            let mut insert_builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO items \
                 (remote_id, feed_id, title, author, content, link, pub_date, read, starred) ",
            );

            insert_builder.push_values(chunk, |mut b, item| {
                b.push_bind(&item.remote_id)
                    .push_bind(feed_id)
                    .push_bind(&item.title)
                    .push_bind(&item.author)
                    .push_bind(&item.content)
                    .push_bind(&item.link)
                    .push_bind(item.pub_date.timestamp())
                    .push_bind(item.is_read)
                    .push_bind(item.is_starred);
            });

            insert_builder.build().execute(&mut *tx).await?;

            // changes() must be read before the reconcile pass below touches
            // more rows.
            let changes: (i64,) = sqlx::query_as("SELECT changes()")
                .fetch_one(&mut *tx)
                .await?;
            total_inserted += changes.0 as usize;

            if policy == StatePolicy::Reconcile {
                let read: Vec<&str> = flag_ids(chunk, |i| i.is_read);
                let unread: Vec<&str> = flag_ids(chunk, |i| !i.is_read);
                let starred: Vec<&str> = flag_ids(chunk, |i| i.is_starred);
                let unstarred: Vec<&str> = flag_ids(chunk, |i| !i.is_starred);

                apply_wire_flag(&mut tx, feed_id, "read", true, &read).await?;
                apply_wire_flag(&mut tx, feed_id, "read", false, &unread).await?;
                apply_wire_flag(&mut tx, feed_id, "starred", true, &starred).await?;
                apply_wire_flag(&mut tx, feed_id, "starred", false, &unstarred).await?;
            }
        }

        tx.commit().await?;
        Ok(total_inserted)
    }

    /// Runs a SELECT produced by
    /// [`build_items_query`](super::queries::build_items_query).
    pub async fn query_items(&self, sql: &str) -> Result<Vec<ItemRow>> {
        let rows = sqlx::query_as::<_, ItemRow>(sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Sets the read flag on an item. Returns false if the item was already
    /// in the requested state (or does not exist).
    ///
    /// For remote accounts the change is recorded as pending so the next
    /// sync pushes it upstream. For separate-state accounts the flag itself
    /// lives in `item_states`, keyed by the item's remote id.
    pub async fn set_item_read(&self, item_id: i64, read: bool, account: &Account) -> Result<bool> {
        let track_change = account.kind != AccountKind::Local;

        if account.kind.separate_state() {
            let Some(remote_id) = self.item_remote_id(item_id).await? else {
                return Ok(false);
            };
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "INSERT INTO item_states (remote_id, account_id, read, starred) \
                 VALUES (?, ?, ?, 0) \
                 ON CONFLICT(remote_id, account_id) DO UPDATE SET read = excluded.read",
            )
            .bind(&remote_id)
            .bind(account.id)
            .bind(read)
            .execute(&mut *tx)
            .await?;
            if track_change {
                sqlx::query("UPDATE items SET read_changed = 1 WHERE id = ?")
                    .bind(item_id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            return Ok(true);
        }

        let result = if track_change {
            sqlx::query("UPDATE items SET read = ?, read_changed = 1 WHERE id = ? AND read != ?")
                .bind(read)
                .bind(item_id)
                .bind(read)
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query("UPDATE items SET read = ? WHERE id = ? AND read != ?")
                .bind(read)
                .bind(item_id)
                .bind(read)
                .execute(&self.pool)
                .await?
        };
        Ok(result.rows_affected() > 0)
    }

    /// Sets the starred flag on an item. Same contract as [`set_item_read`].
    ///
    /// [`set_item_read`]: Database::set_item_read
    pub async fn set_item_starred(
        &self,
        item_id: i64,
        starred: bool,
        account: &Account,
    ) -> Result<bool> {
        let track_change = account.kind != AccountKind::Local;

        if account.kind.separate_state() {
            let Some(remote_id) = self.item_remote_id(item_id).await? else {
                return Ok(false);
            };
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "INSERT INTO item_states (remote_id, account_id, read, starred) \
                 VALUES (?, ?, 1, ?) \
                 ON CONFLICT(remote_id, account_id) DO UPDATE SET starred = excluded.starred",
            )
            .bind(&remote_id)
            .bind(account.id)
            .bind(starred)
            .execute(&mut *tx)
            .await?;
            if track_change {
                sqlx::query("UPDATE items SET starred_changed = 1 WHERE id = ?")
                    .bind(item_id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            return Ok(true);
        }

        let result = if track_change {
            sqlx::query(
                "UPDATE items SET starred = ?, starred_changed = 1 WHERE id = ? AND starred != ?",
            )
            .bind(starred)
            .bind(item_id)
            .bind(starred)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query("UPDATE items SET starred = ? WHERE id = ? AND starred != ?")
                .bind(starred)
                .bind(item_id)
                .bind(starred)
                .execute(&self.pool)
                .await?
        };
        Ok(result.rows_affected() > 0)
    }

    async fn item_remote_id(&self, item_id: i64) -> Result<Option<String>> {
        let remote_id =
            sqlx::query_scalar::<_, String>("SELECT remote_id FROM items WHERE id = ?")
                .bind(item_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(remote_id)
    }

    /// Pending read-state changes for an account: `(remote_id, read)` pairs
    /// that have not been pushed upstream yet.
    pub async fn read_changes(&self, account: &Account) -> Result<Vec<(String, bool)>> {
        let sql = if account.kind.separate_state() {
            // A pending change with no state row means "marked read" by the
            // missing-row convention.
            "SELECT items.remote_id, COALESCE(item_states.read, 1) \
             FROM items \
             INNER JOIN feeds ON items.feed_id = feeds.id \
             LEFT JOIN item_states ON item_states.remote_id = items.remote_id \
                 AND item_states.account_id = feeds.account_id \
             WHERE feeds.account_id = ? AND items.read_changed = 1"
        } else {
            "SELECT items.remote_id, items.read \
             FROM items \
             INNER JOIN feeds ON items.feed_id = feeds.id \
             WHERE feeds.account_id = ? AND items.read_changed = 1"
        };
        let rows: Vec<(String, bool)> = sqlx::query_as(sql)
            .bind(account.id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Pending starred-state changes for an account.
    pub async fn starred_changes(&self, account: &Account) -> Result<Vec<(String, bool)>> {
        let sql = if account.kind.separate_state() {
            "SELECT items.remote_id, COALESCE(item_states.starred, 0) \
             FROM items \
             INNER JOIN feeds ON items.feed_id = feeds.id \
             LEFT JOIN item_states ON item_states.remote_id = items.remote_id \
                 AND item_states.account_id = feeds.account_id \
             WHERE feeds.account_id = ? AND items.starred_changed = 1"
        } else {
            "SELECT items.remote_id, items.starred \
             FROM items \
             INNER JOIN feeds ON items.feed_id = feeds.id \
             WHERE feeds.account_id = ? AND items.starred_changed = 1"
        };
        let rows: Vec<(String, bool)> = sqlx::query_as(sql)
            .bind(account.id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Clears the pending-change flags after a successful push.
    pub async fn reset_sync_flags(&self, account_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE items SET read_changed = 0, starred_changed = 0 \
             WHERE feed_id IN (SELECT id FROM feeds WHERE account_id = ?)",
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replaces per-remote-id state rows from a backend's id lists.
    pub async fn upsert_item_states(&self, account_id: i64, states: &[ItemState]) -> Result<()> {
        if states.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in states.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO item_states (remote_id, account_id, read, starred) ");
            builder.push_values(chunk, |mut b, state| {
                b.push_bind(&state.remote_id)
                    .push_bind(account_id)
                    .push_bind(state.read)
                    .push_bind(state.starred);
            });
            builder.push(
                " ON CONFLICT(remote_id, account_id) \
                 DO UPDATE SET read = excluded.read, starred = excluded.starred",
            );
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// All item remote ids stored for an account.
    pub async fn account_item_remote_ids(&self, account_id: i64) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT items.remote_id FROM items \
             INNER JOIN feeds ON items.feed_id = feeds.id \
             WHERE feeds.account_id = ?",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

fn flag_ids(chunk: &[Item], pred: impl Fn(&Item) -> bool) -> Vec<&str> {
    chunk
        .iter()
        .filter(|item| pred(item))
        .map(|item| item.remote_id.as_str())
        .collect()
}

/// One bulk UPDATE folding a wire flag value into existing rows, guarded by
/// the matching pending-change column.
async fn apply_wire_flag(
    tx: &mut Transaction<'_, Sqlite>,
    feed_id: i64,
    column: &str,
    value: bool,
    remote_ids: &[&str],
) -> Result<()> {
    if remote_ids.is_empty() {
        return Ok(());
    }

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "UPDATE items SET {column} = {} WHERE {column}_changed = 0 AND feed_id = ",
        value as i64
    ));
    builder.push_bind(feed_id);
    builder.push(" AND remote_id IN (");
    let mut separated = builder.separated(", ");
    for id in remote_ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
    builder.build().execute(&mut **tx).await?;
    Ok(())
}
