//! HTTP auth backend: token validation and login.

use async_trait::async_trait;
use meridian_core::User;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::protocol::error_message;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
    remember_me: bool,
}

/// Body of `POST /auth/login`, for both outcomes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl LoginResponse {
    /// Server-provided failure reason, or a generic one.
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(error_message)
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "Login failed".to_string())
    }
}

// =============================================================================
// Backend Trait
// =============================================================================

/// The REST endpoints the session depends on.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Returns the profile owning `token`.
    async fn who_am_i(&self, token: &str) -> SyncResult<User>;

    /// Exchanges credentials for a session. Rejected credentials come back
    /// as `Ok` with `success == false`.
    async fn login(&self, email: &str, password: &str, remember_me: bool)
        -> SyncResult<LoginResponse>;
}

// =============================================================================
// HTTP Backend
// =============================================================================

/// [`AuthBackend`] over reqwest.
#[derive(Debug, Clone)]
pub struct HttpAuthBackend {
    http: Client,
    base_url: Url,
}

impl HttpAuthBackend {
    /// `api_url` is the REST root, e.g. `http://localhost:3001/api`.
    pub fn new(api_url: Url) -> SyncResult<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_http_client(api_url, http))
    }

    /// Uses a caller-provided `reqwest::Client`.
    pub fn with_http_client(mut api_url: Url, http: Client) -> Self {
        // Relative joins must keep the last path segment
        if !api_url.path().ends_with('/') {
            let path = format!("{}/", api_url.path());
            api_url.set_path(&path);
        }
        HttpAuthBackend {
            http,
            base_url: api_url,
        }
    }

    fn endpoint(&self, path: &str) -> SyncResult<Url> {
        Ok(self.base_url.join(path)?)
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn who_am_i(&self, token: &str) -> SyncResult<User> {
        let url = self.endpoint("auth/me")?;
        debug!(%url, "Validating session token");

        let resp = self.http.get(url).bearer_auth(token).send().await?;
        let body = parse_response(resp).await?;

        if body.get("success").and_then(Value::as_bool) == Some(false) {
            let reason = body
                .get("error")
                .map(error_message)
                .unwrap_or_else(|| "token rejected".to_string());
            return Err(SyncError::AuthRejected(reason));
        }

        // `{ user: {...} }` or the bare profile
        let user = match body {
            Value::Object(mut obj) if obj.contains_key("user") => obj.remove("user").unwrap_or_default(),
            other => other,
        };
        Ok(serde_json::from_value(user)?)
    }

    async fn login(
        &self,
        email: &str,
        password: &str,
        remember_me: bool,
    ) -> SyncResult<LoginResponse> {
        let url = self.endpoint("auth/login")?;
        debug!(%url, email, "Logging in");

        let resp = self
            .http
            .post(url)
            .json(&LoginRequest {
                email,
                password,
                remember_me,
            })
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        // Rejections carry a `{ success: false, error }` body on 4xx
        match serde_json::from_str::<LoginResponse>(&text) {
            Ok(body) if status.is_success() || !body.success => Ok(body),
            _ if status.is_success() => Err(SyncError::Serialization(format!(
                "unexpected login response: {}",
                text
            ))),
            _ => Err(api_error(status, &text)),
        }
    }
}

async fn parse_response(resp: Response) -> SyncResult<Value> {
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        return Err(api_error(status, &text));
    }
    Ok(serde_json::from_str(&text)?)
}

fn api_error(status: StatusCode, body: &str) -> SyncError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").or_else(|| v.get("message")).map(error_message))
        .unwrap_or_else(|| body.to_string());
    SyncError::Api {
        status: status.as_u16(),
        message,
    }
}
