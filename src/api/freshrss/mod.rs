//! FreshRSS client speaking the Google Reader compatibility API.
//!
//! Authentication is two-staged: `ClientLogin` yields a long-lived session
//! token sent as `Authorization: GoogleLogin auth=...` on every call, and a
//! short-lived write token fetched separately must accompany every mutation.
//! Reads are GETs returning JSON documents handled by [`adapters`]; the one
//! mutation, `edit-tag`, is a form POST.

pub mod adapters;

use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tokio::time::timeout;

use crate::api::{ensure_success, read_limited_bytes, SyncError, MAX_RESPONSE_SIZE, REQUEST_TIMEOUT};
use crate::storage::{Item, RemoteFeed, RemoteFolder};

/// Client for one FreshRSS instance.
pub struct FreshRssClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    write_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserInfo {
    #[serde(rename = "userName")]
    pub user_name: String,
}

impl FreshRssClient {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            token: None,
            write_token: None,
        }
    }

    /// Restores a session token persisted from an earlier login.
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Exchanges credentials for a session token via `ClientLogin`.
    ///
    /// The response is a line-oriented key=value document; only the `Auth`
    /// line matters. The token is retained on the client and returned for
    /// persistence.
    pub async fn login(&mut self, login: &str, password: &str) -> Result<String, SyncError> {
        let url = format!("{}/accounts/ClientLogin", self.base_url);
        let request = self
            .client
            .post(&url)
            .form(&[("Email", login), ("Passwd", password)])
            .send();
        let response = timeout(REQUEST_TIMEOUT, request)
            .await
            .map_err(|_| SyncError::Timeout)??;

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(SyncError::Auth(
                "FreshRSS rejected the login credentials".into(),
            ));
        }
        let response = ensure_success(response)?;
        let body = read_limited_bytes(response, MAX_RESPONSE_SIZE).await?;
        let body = String::from_utf8_lossy(&body);

        let token = body
            .lines()
            .find_map(|line| line.strip_prefix("Auth="))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncError::Auth("ClientLogin response has no Auth token".into()))?
            .to_owned();

        self.token = Some(token.clone());
        Ok(token)
    }

    /// Fetches the write token required by `edit-tag` calls.
    pub async fn fetch_write_token(&mut self) -> Result<String, SyncError> {
        let url = format!("{}/reader/api/0/token", self.base_url);
        let response = self.get(&url).await?;
        let body = read_limited_bytes(response, MAX_RESPONSE_SIZE).await?;
        let token = String::from_utf8_lossy(&body).trim().to_owned();
        if token.is_empty() {
            return Err(SyncError::Auth("token endpoint returned an empty body".into()));
        }
        self.write_token = Some(token.clone());
        Ok(token)
    }

    pub async fn user_info(&self) -> Result<UserInfo, SyncError> {
        let url = format!("{}/reader/api/0/user-info?output=json", self.base_url);
        let response = self.get(&url).await?;
        let body = read_limited_bytes(response, MAX_RESPONSE_SIZE).await?;
        serde_json::from_slice(&body)
            .map_err(|e| SyncError::Parse(crate::api::ParseError::from(e)))
    }

    pub async fn folders(&self) -> Result<Vec<RemoteFolder>, SyncError> {
        let url = format!("{}/reader/api/0/tag/list?output=json", self.base_url);
        let response = self.get(&url).await?;
        let body = read_limited_bytes(response, MAX_RESPONSE_SIZE).await?;
        Ok(adapters::parse_folders(&body)?)
    }

    pub async fn feeds(&self) -> Result<Vec<RemoteFeed>, SyncError> {
        let url = format!(
            "{}/reader/api/0/subscription/list?output=json",
            self.base_url
        );
        let response = self.get(&url).await?;
        let body = read_limited_bytes(response, MAX_RESPONSE_SIZE).await?;
        Ok(adapters::parse_feeds(&body)?)
    }

    /// Fetches up to `count` reading-list items, newest first. When `since`
    /// is set, only items crawled after that epoch second are returned.
    pub async fn items(&self, count: usize, since: Option<i64>) -> Result<Vec<Item>, SyncError> {
        let mut url = format!(
            "{}/reader/api/0/stream/contents/user/-/state/com.google/reading-list?output=json&n={count}",
            self.base_url
        );
        if let Some(since) = since {
            url.push_str(&format!("&ot={since}"));
        }
        let response = self.get(&url).await?;
        let body = read_limited_bytes(response, MAX_RESPONSE_SIZE).await?;
        Ok(adapters::parse_items(&body)?)
    }

    /// Fetches up to `count` starred items. Used on the first sync, where
    /// old starred items would otherwise fall outside the reading-list page.
    pub async fn starred_items(&self, count: usize) -> Result<Vec<Item>, SyncError> {
        let url = format!(
            "{}/reader/api/0/stream/contents/user/-/state/com.google/starred?output=json&n={count}",
            self.base_url
        );
        let response = self.get(&url).await?;
        let body = read_limited_bytes(response, MAX_RESPONSE_SIZE).await?;
        Ok(adapters::parse_items(&body)?)
    }

    /// Adds and/or removes a state tag on a batch of items.
    ///
    /// Item ids repeat as `i` parameters; `a` adds a stream, `r` removes
    /// one. The server answers `OK` on success, which we do not bother to
    /// parse beyond the status code.
    pub async fn edit_tags(
        &self,
        item_ids: &[String],
        add: Option<&str>,
        remove: Option<&str>,
    ) -> Result<(), SyncError> {
        if item_ids.is_empty() {
            return Ok(());
        }
        let write_token = self
            .write_token
            .as_deref()
            .ok_or(SyncError::MissingCredentials("write token"))?;

        let mut params: Vec<(&str, &str)> = Vec::with_capacity(item_ids.len() + 3);
        for id in item_ids {
            params.push(("i", id));
        }
        if let Some(stream) = add {
            params.push(("a", stream));
        }
        if let Some(stream) = remove {
            params.push(("r", stream));
        }
        params.push(("T", write_token));

        let url = format!("{}/reader/api/0/edit-tag", self.base_url);
        let request = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header()?)
            .form(&params)
            .send();
        let response = timeout(REQUEST_TIMEOUT, request)
            .await
            .map_err(|_| SyncError::Timeout)??;
        ensure_success(response)?;
        Ok(())
    }

    fn auth_header(&self) -> Result<String, SyncError> {
        let token = self
            .token
            .as_deref()
            .ok_or(SyncError::MissingCredentials("session token"))?;
        Ok(format!("GoogleLogin auth={token}"))
    }

    async fn get(&self, url: &str) -> Result<Response, SyncError> {
        let request = self
            .client
            .get(url)
            .header("Authorization", self.auth_header()?)
            .send();
        let response = timeout(REQUEST_TIMEOUT, request)
            .await
            .map_err(|_| SyncError::Timeout)??;
        ensure_success(response)
    }
}
