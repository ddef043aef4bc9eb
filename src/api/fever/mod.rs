//! Fever API client.
//!
//! Fever routes everything through one endpoint: a POST whose query string
//! selects the operation (`?api&items`, `?api&groups`, ...) and whose form
//! body carries `api_key = md5("login:password")`. Authentication failures
//! come back in-band as `"auth": 0` with HTTP 200, so every call that
//! matters is preceded by [`FeverClient::validate`].

pub mod adapters;

use md5::{Digest, Md5};

use crate::api::{ensure_success, read_limited_bytes, SyncError, MAX_RESPONSE_SIZE, REQUEST_TIMEOUT};
use crate::storage::Item;

use adapters::{FeedsDocument, FeverGroup};

/// Fever serves items in pages of 50; a shorter page means the end.
const PAGE_SIZE: usize = 50;

/// State transition for `?api&mark=item`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkAction {
    Read,
    Unread,
    Saved,
    Unsaved,
}

impl MarkAction {
    fn as_str(&self) -> &'static str {
        match self {
            MarkAction::Read => "read",
            MarkAction::Unread => "unread",
            MarkAction::Saved => "saved",
            MarkAction::Unsaved => "unsaved",
        }
    }
}

pub struct FeverClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl FeverClient {
    /// Builds a client for one Fever endpoint.
    ///
    /// The credential handshake is fixed by the protocol: the hex md5 digest
    /// of `login:password`, sent as a form field with every request. The
    /// plaintext password is not retained.
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        login: &str,
        password: &str,
    ) -> Self {
        let api_key = format!("{:x}", Md5::digest(format!("{login}:{password}")));
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        }
    }

    async fn call(&self, query: &str) -> Result<Vec<u8>, SyncError> {
        let url = format!("{}?api{}", self.endpoint, query);
        let response = tokio::time::timeout(
            REQUEST_TIMEOUT,
            self.client
                .post(&url)
                .form(&[("api_key", self.api_key.as_str())])
                .send(),
        )
        .await
        .map_err(|_| SyncError::Timeout)?
        .map_err(SyncError::Network)?;
        let response = ensure_success(response)?;
        read_limited_bytes(response, MAX_RESPONSE_SIZE).await
    }

    /// Checks the api_key against the server.
    pub async fn validate(&self) -> Result<(), SyncError> {
        let body = self.call("").await?;
        if adapters::parse_auth(&body)? {
            Ok(())
        } else {
            Err(SyncError::Auth("Fever rejected the api_key".to_owned()))
        }
    }

    pub async fn groups(&self) -> Result<Vec<FeverGroup>, SyncError> {
        let body = self.call("&groups").await?;
        Ok(adapters::parse_groups(&body)?)
    }

    pub async fn feeds(&self) -> Result<FeedsDocument, SyncError> {
        let body = self.call("&feeds").await?;
        Ok(adapters::parse_feeds(&body)?)
    }

    /// One page of items with ids above `since_id`, in wire order.
    pub async fn items_page(&self, since_id: i64) -> Result<Vec<Item>, SyncError> {
        let body = self.call(&format!("&items&since_id={since_id}")).await?;
        Ok(adapters::parse_items(&body)?)
    }

    /// All items with ids above `since_id`, following Fever's 50-per-page
    /// window until a short page.
    ///
    /// The cursor advances to the highest numeric id in each page; a page
    /// whose ids cannot advance the cursor ends the loop rather than
    /// refetching the same window forever.
    pub async fn items_since(&self, since_id: i64) -> Result<Vec<Item>, SyncError> {
        let mut all = Vec::new();
        let mut cursor = since_id;

        loop {
            let page = self.items_page(cursor).await?;
            let full_page = page.len() >= PAGE_SIZE;
            let max_id = page
                .iter()
                .filter_map(|item| item.remote_id.parse::<i64>().ok())
                .max();
            all.extend(page);

            match max_id {
                Some(max) if full_page && max > cursor => cursor = max,
                _ => break,
            }
        }

        Ok(all)
    }

    pub async fn unread_item_ids(&self) -> Result<Vec<String>, SyncError> {
        let body = self.call("&unread_item_ids").await?;
        Ok(adapters::parse_item_ids(&body)?.unread.unwrap_or_default())
    }

    pub async fn saved_item_ids(&self) -> Result<Vec<String>, SyncError> {
        let body = self.call("&saved_item_ids").await?;
        Ok(adapters::parse_item_ids(&body)?.saved.unwrap_or_default())
    }

    /// Pushes one state change upstream.
    pub async fn mark_item(&self, remote_id: &str, action: MarkAction) -> Result<(), SyncError> {
        self.call(&format!("&mark=item&as={}&id={}", action.as_str(), remote_id))
            .await?;
        Ok(())
    }
}
