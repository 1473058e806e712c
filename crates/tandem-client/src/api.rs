//! HTTP collaborator: message history and the user directory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use tandem_shared::{MessageId, PublicKey, UserId};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server answered {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Not found")]
    NotFound,
}

/// A stored message as returned by the history endpoint. `message` is
/// still ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub viewed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub profile_picture: Option<String>,
    #[serde(default)]
    pub public_key: Option<PublicKey>,
}

#[derive(Deserialize)]
struct ProfileResponse {
    user: UserProfile,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    users: Vec<UserProfile>,
}

/// Authenticated request/response operations. Every call carries the
/// bearer token read from secure storage.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Every message the user sent or received, oldest first.
    async fn fetch_messages(&self, token: &str, user: &UserId) -> Result<Vec<MessageRecord>, ApiError>;

    async fn fetch_profile(&self, token: &str, user: &UserId) -> Result<UserProfile, ApiError>;

    async fn mark_viewed(&self, token: &str, id: &MessageId) -> Result<(), ApiError>;

    async fn search_users(&self, token: &str, query: &str) -> Result<Vec<UserProfile>, ApiError>;
}

/// [`ChatApi`] over HTTP with reqwest.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ChatApi for HttpApi {
    async fn fetch_messages(&self, token: &str, user: &UserId) -> Result<Vec<MessageRecord>, ApiError> {
        let resp = self
            .client
            .get(self.url(&format!("/messages/getMessages/{user}")))
            .bearer_auth(token)
            .send()
            .await?;
        let records: Vec<MessageRecord> = check(resp).await?.json().await?;
        debug!(user = %user.short(), count = records.len(), "Fetched message history");
        Ok(records)
    }

    async fn fetch_profile(&self, token: &str, user: &UserId) -> Result<UserProfile, ApiError> {
        let resp = self
            .client
            .get(self.url(&format!("/get_user/{user}")))
            .bearer_auth(token)
            .send()
            .await?;
        let body: ProfileResponse = check(resp).await?.json().await?;
        Ok(body.user)
    }

    async fn mark_viewed(&self, token: &str, id: &MessageId) -> Result<(), ApiError> {
        let resp = self
            .client
            .put(self.url(&format!("/messages/view/{id}")))
            .bearer_auth(token)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn search_users(&self, token: &str, query: &str) -> Result<Vec<UserProfile>, ApiError> {
        let resp = self
            .client
            .get(self.url("/search_users"))
            .query(&[("query", query)])
            .bearer_auth(token)
            .send()
            .await?;
        let body: SearchResponse = check(resp).await?.json().await?;
        Ok(body.users)
    }
}
