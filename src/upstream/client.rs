//! HTTP client for the upstream admin task API

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::types::TaskKind;

/// Upstream API error
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream API error (code {code}): {message}")]
    Api { code: i64, message: String },
    #[error("upstream connection error: {0}")]
    Connection(String),
    #[error("upstream authentication failed")]
    AuthenticationFailed,
    #[error("token does not belong to the admin user (id {0})")]
    NotAdmin(i64),
}

impl From<UpstreamError> for RelayError {
    fn from(e: UpstreamError) -> Self {
        RelayError::Upstream(e.to_string())
    }
}

/// `{code, message, data}` reply wrapper used by every upstream route
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

/// A background job as listed by the upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamTask {
    pub id: String,
    pub name: String,
    /// Numeric tache state
    #[serde(default)]
    pub state: i64,
    /// Free-form progress text
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub error: String,
}

/// Current user, as reported by `/api/me`
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub id: i64,
    #[serde(default)]
    pub username: String,
}

/// Upstream admin API client
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl UpstreamClient {
    /// Create a client for `base_url` authenticated with `token`
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the token's user
    pub async fn me(&self) -> Result<UserInfo> {
        self.get::<UserInfo>("/api/me").await?.ok_or_else(|| {
            UpstreamError::Api {
                code: 200,
                message: "missing user data".to_string(),
            }
            .into()
        })
    }

    /// Fail unless the token belongs to the admin user
    pub async fn verify_admin(&self) -> Result<UserInfo> {
        let user = self.me().await?;
        if user.id != 1 {
            return Err(UpstreamError::NotAdmin(user.id).into());
        }
        Ok(user)
    }

    /// Jobs that have not finished yet
    pub async fn list_undone(&self, kind: TaskKind) -> Result<Vec<UpstreamTask>> {
        let path = format!("/api/admin/task/{}/undone", kind.route());
        Ok(self.get::<Vec<UpstreamTask>>(&path).await?.unwrap_or_default())
    }

    /// Jobs that reached a final state
    pub async fn list_done(&self, kind: TaskKind) -> Result<Vec<UpstreamTask>> {
        let path = format!("/api/admin/task/{}/done", kind.route());
        Ok(self.get::<Vec<UpstreamTask>>(&path).await?.unwrap_or_default())
    }

    /// Delete a finished job from the upstream list
    pub async fn remove(&self, kind: TaskKind, id: &str) -> Result<()> {
        let url = format!(
            "{}/api/admin/task/{}/delete",
            self.base_url,
            kind.route()
        );
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, &self.token)
            .query(&[("tid", id)])
            .send()
            .await
            .map_err(|e| UpstreamError::Connection(e.to_string()))?;
        Self::unwrap_envelope::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, &self.token)
            .send()
            .await
            .map_err(|e| UpstreamError::Connection(e.to_string()))?;
        Ok(Self::unwrap_envelope(response).await?)
    }

    async fn unwrap_envelope<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> std::result::Result<Option<T>, UpstreamError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(UpstreamError::AuthenticationFailed);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Api {
                code: i64::from(status.as_u16()),
                message: body,
            });
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| UpstreamError::Connection(format!("invalid response body: {}", e)))?;
        match envelope.code {
            200..=299 => Ok(envelope.data),
            401 => Err(UpstreamError::AuthenticationFailed),
            code => Err(UpstreamError::Api {
                code,
                message: envelope.message,
            }),
        }
    }
}
