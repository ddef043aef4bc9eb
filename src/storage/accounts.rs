use anyhow::Result;

use super::schema::Database;
use super::types::{Account, AccountKind};

impl Database {
    // ========================================================================
    // Account Operations
    // ========================================================================

    pub async fn insert_account(
        &self,
        name: &str,
        kind: AccountKind,
        url: Option<&str>,
        login: Option<&str>,
        password: Option<&str>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO accounts (name, kind, url, login, password) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(kind)
        .bind(url)
        .bind(login)
        .bind(password)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let accounts = sqlx::query_as::<_, Account>("SELECT * FROM accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(accounts)
    }

    /// The account owning an item, resolved through its feed. Marking an
    /// item read or starred needs the account kind to pick the right state
    /// table.
    pub async fn account_for_item(&self, item_id: i64) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT accounts.* FROM accounts \
             INNER JOIN feeds ON feeds.account_id = accounts.id \
             INNER JOIN items ON items.feed_id = feeds.id \
             WHERE items.id = ?",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    /// Finds the account matching a config entry, or creates it.
    ///
    /// Identity is `(kind, url, login)`; the password follows the config
    /// file, so a rotated password takes effect without duplicating the
    /// account. The name is set only at creation, since a FreshRSS sync
    /// may later replace it with the server-side display name. `IS ?`
    /// instead of `= ?` makes the NULL url of local accounts compare equal.
    pub async fn ensure_account(
        &self,
        name: &str,
        kind: AccountKind,
        url: Option<&str>,
        login: Option<&str>,
        password: Option<&str>,
    ) -> Result<Account> {
        let existing = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE kind = ? AND url IS ? AND login IS ?",
        )
        .bind(kind)
        .bind(url)
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;

        let account_id = match existing {
            Some(account) => {
                if account.password.as_deref() != password {
                    sqlx::query("UPDATE accounts SET password = ? WHERE id = ?")
                        .bind(password)
                        .bind(account.id)
                        .execute(&self.pool)
                        .await?;
                }
                account.id
            }
            None => {
                tracing::info!(name = %name, kind = %kind, "creating account");
                self.insert_account(name, kind, url, login, password).await?
            }
        };

        let account = self
            .get_account(account_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("account {account_id} vanished during setup"))?;
        Ok(account)
    }

    /// FreshRSS reports the user's display name after login; mirror it.
    pub async fn update_account_name(&self, account_id: i64, name: &str) -> Result<()> {
        sqlx::query("UPDATE accounts SET name = ? WHERE id = ?")
            .bind(name)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_account_token(&self, account_id: i64, token: &str) -> Result<()> {
        sqlx::query("UPDATE accounts SET token = ? WHERE id = ?")
            .bind(token)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_account_write_token(
        &self,
        account_id: i64,
        write_token: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE accounts SET write_token = ? WHERE id = ?")
            .bind(write_token)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Advances the sync watermark. Monotonic by contract: callers pass the
    /// max of the old value and what the sync observed.
    pub async fn update_account_last_modified(
        &self,
        account_id: i64,
        last_modified: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE accounts SET last_modified = ? WHERE id = ?")
            .bind(last_modified)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
