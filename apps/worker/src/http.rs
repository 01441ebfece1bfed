//! HTTP helper: JSON fetches with retry and credential refresh.
//!
//! Transient failures (network errors, 5xx) are retried with a short fixed
//! delay; 401/403 triggers a token refresh before the next attempt. Callers
//! see an error only after the retry budget is exhausted.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::credentials::CredentialStore;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server error: {status} - {message}")]
    Status { status: u16, message: String },

    #[error("response parse error: {0}")]
    Parse(String),

    #[error("authentication failed: {0}")]
    Auth(String),
}

const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct HttpSession {
    client: reqwest::Client,
    base_url: String,
    creds: Arc<dyn CredentialStore>,
}

impl HttpSession {
    pub fn new(base_url: &str, creds: Arc<dyn CredentialStore>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            creds,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a possibly-relative URL against the base.
    pub fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }

    /// GET (or POST when a body is given) returning parsed JSON.
    pub async fn fetch_json(
        &self,
        url: &str,
        body: Option<&Value>,
        retries: u32,
    ) -> Result<Value, HttpError> {
        let url = self.absolute(url);
        let mut last = HttpError::Network("no attempt made".to_string());

        for attempt in 0..=retries {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            let mut req = match body {
                Some(json) => self.client.post(&url).json(json),
                None => self.client.get(&url),
            };
            if let Some(token) = self.creds.access_token() {
                req = req.bearer_auth(token);
            }

            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "request failed, retrying");
                    last = HttpError::Network(e.to_string());
                    continue;
                }
            };

            let status = resp.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                tracing::debug!(url = %url, "credentials rejected, refreshing");
                self.refresh_access_token().await?;
                last = HttpError::Auth("credentials rejected".to_string());
                continue;
            }
            if status.is_server_error() {
                tracing::warn!(url = %url, status = status.as_u16(), "server error, retrying");
                last = HttpError::Status {
                    status: status.as_u16(),
                    message: resp.text().await.unwrap_or_default(),
                };
                continue;
            }
            if !status.is_success() {
                return Err(HttpError::Status {
                    status: status.as_u16(),
                    message: resp.text().await.unwrap_or_default(),
                });
            }
            return resp
                .json::<Value>()
                .await
                .map_err(|e| HttpError::Parse(e.to_string()));
        }
        Err(last)
    }

    /// GET raw bytes with the same retry policy.
    pub async fn fetch_bytes(&self, url: &str, retries: u32) -> Result<Vec<u8>, HttpError> {
        let url = self.absolute(url);
        let mut last = HttpError::Network("no attempt made".to_string());

        for attempt in 0..=retries {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            let mut req = self.client.get(&url);
            if let Some(token) = self.creds.access_token() {
                req = req.bearer_auth(token);
            }
            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last = HttpError::Network(e.to_string());
                    continue;
                }
            };
            let status = resp.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                self.refresh_access_token().await?;
                last = HttpError::Auth("credentials rejected".to_string());
                continue;
            }
            if status.is_server_error() {
                last = HttpError::Status {
                    status: status.as_u16(),
                    message: String::new(),
                };
                continue;
            }
            if !status.is_success() {
                return Err(HttpError::Status {
                    status: status.as_u16(),
                    message: String::new(),
                });
            }
            return resp
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| HttpError::Network(e.to_string()));
        }
        Err(last)
    }

    /// Exchange the refresh token for a new access token and persist it.
    pub async fn refresh_access_token(&self) -> Result<(), HttpError> {
        let refresh = self
            .creds
            .refresh_token()
            .ok_or_else(|| HttpError::Auth("no refresh token, must re-login".to_string()))?;

        let url = format!("{}/api/v1/token/refresh/", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "refresh": refresh }))
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(HttpError::Auth(format!(
                "token refresh rejected with status {}",
                resp.status().as_u16()
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| HttpError::Parse(e.to_string()))?;
        let access = body
            .get("access")
            .and_then(Value::as_str)
            .ok_or_else(|| HttpError::Parse("refresh response missing access token".to_string()))?;
        self.creds.set_access_token(access);
        tracing::info!("access token refreshed");
        Ok(())
    }
}
