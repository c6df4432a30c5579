//! Outbound platform API client.
//!
//! The watchdog talks to each session's platform server for exactly one
//! thing: renewing the session's access/recovery token pair. Responses come
//! wrapped in the platform's `{"success":…,"message":…,"payload":…}`
//! envelope.
//!
//! Failures are typed rather than thrown: [`ApiError::is_retryable`]
//! distinguishes transient conditions (unauthorized, transport) — retried
//! with a fixed backoff at the call site — from ones that won't improve by
//! waiting. A failed renewal is never fatal to the watchdog; the caller
//! keeps the old tokens and tries again on the next due cycle.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Platform endpoint that exchanges a recovery token for a fresh pair.
pub const TOKEN_RENEWAL_ENDPOINT: &str = "api/User/RequestToken";

/// Fixed backoff applied between retryable attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(4);

/// Attempts per renewal cycle before giving up until the next due check.
const MAX_RENEWAL_ATTEMPTS: u32 = 3;

/// An access or recovery token as the platform hands it out.
///
/// The watchdog treats the token as opaque; `valid_until` is carried along
/// for the workers but never interpreted here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiToken {
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<String>,
}

impl ApiToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            valid_until: None,
        }
    }

    /// Parse a token field from an inbound request: either the platform's
    /// JSON object shape or, as a fallback, a raw token string.
    pub fn parse_lenient(value: &str) -> Self {
        serde_json::from_str(value).unwrap_or_else(|_| Self::new(value))
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }
}

/// A session's current access token and its renewal credential.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenPair {
    pub access: ApiToken,
    pub recovery: ApiToken,
}

/// Typed outcome classification for platform API calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// HTTP 401 — the platform refused the bearer token. Transient: tokens
    /// rotate, so the call is worth retrying after a short wait.
    #[error("API refused access (unauthorized) at {url}")]
    Unauthorized { url: String },
    /// The request never completed (connect, DNS, timeout).
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    /// The platform answered but rejected the call or returned an envelope
    /// this client cannot use.
    #[error("API call to {url} failed: {message}")]
    Rejected { url: String, message: String },
}

impl ApiError {
    /// Whether waiting and retrying can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::Transport { .. })
    }
}

/// The platform's standard response envelope.
#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RequestTokenResponse {
    api_access_token: String,
    api_refresh_token: String,
}

/// Thin reqwest wrapper for the platform API. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ApiClient {
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exchange `recovery_token` for a fresh token pair at the session's
    /// platform server.
    pub async fn request_token(
        &self,
        api_root: &str,
        access_token: &str,
        recovery_token: &str,
    ) -> Result<TokenPair, ApiError> {
        let payload = self
            .perform(
                api_root,
                TOKEN_RENEWAL_ENDPOINT,
                access_token,
                &[("api_refresh_token", recovery_token)],
            )
            .await?;

        let url = join_url(api_root, TOKEN_RENEWAL_ENDPOINT);
        let response: RequestTokenResponse =
            serde_json::from_value(payload).map_err(|e| ApiError::Rejected {
                url,
                message: format!("unexpected payload shape: {e}"),
            })?;

        Ok(TokenPair {
            access: ApiToken::new(response.api_access_token),
            recovery: ApiToken::new(response.api_refresh_token),
        })
    }

    /// [`Self::request_token`] with the fixed-backoff retry loop applied to
    /// retryable failures.
    pub async fn request_token_with_retry(
        &self,
        api_root: &str,
        access_token: &str,
        recovery_token: &str,
    ) -> Result<TokenPair, ApiError> {
        let mut attempt = 1;
        loop {
            match self.request_token(api_root, access_token, recovery_token).await {
                Ok(pair) => return Ok(pair),
                Err(e) if e.is_retryable() && attempt < MAX_RENEWAL_ATTEMPTS => {
                    info!(
                        "API refused access... Waiting {} sec and retrying ({e})",
                        RETRY_DELAY.as_secs()
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Form-POST one platform endpoint and unwrap the response envelope,
    /// returning the payload.
    async fn perform(
        &self,
        api_root: &str,
        endpoint: &str,
        access_token: &str,
        form: &[(&str, &str)],
    ) -> Result<serde_json::Value, ApiError> {
        let url = join_url(api_root, endpoint);

        let mut request = self.http.post(&url).form(form);
        if !access_token.is_empty() {
            request = request.bearer_auth(access_token);
        }

        let response = request.send().await.map_err(|source| ApiError::Transport {
            url: url.clone(),
            source,
        })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized { url });
        }
        if !response.status().is_success() {
            return Err(ApiError::Rejected {
                url,
                message: format!("HTTP status {}", response.status()),
            });
        }

        let envelope: ResponseEnvelope =
            response.json().await.map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;

        if !envelope.success {
            let message = envelope
                .message
                .unwrap_or_else(|| "no message in response".to_string());
            warn!("API call to {url} reported failure: {message}");
            return Err(ApiError::Rejected { url, message });
        }

        Ok(envelope.payload.unwrap_or(serde_json::Value::Null))
    }
}

fn join_url(api_root: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        api_root.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_parses_platform_json_shape() {
        let token = ApiToken::parse_lenient(r#"{"token":"abc","valid_until":"2030-01-01"}"#);
        assert_eq!(token.as_str(), "abc");
        assert_eq!(token.valid_until.as_deref(), Some("2030-01-01"));
    }

    #[test]
    fn token_falls_back_to_raw_string() {
        let token = ApiToken::parse_lenient("just-a-raw-token");
        assert_eq!(token.as_str(), "just-a-raw-token");
        assert_eq!(token.valid_until, None);
    }

    #[test]
    fn envelope_deserializes_with_missing_fields() {
        let envelope: ResponseEnvelope = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(envelope.success);
        assert!(envelope.message.is_none());
        assert!(envelope.payload.is_none());
    }

    #[test]
    fn join_url_handles_trailing_slash() {
        assert_eq!(
            join_url("http://host/session/1/", "api/User/RequestToken"),
            "http://host/session/1/api/User/RequestToken"
        );
        assert_eq!(
            join_url("http://host/session/1", "/api/User/RequestToken"),
            "http://host/session/1/api/User/RequestToken"
        );
    }

    #[test]
    fn unauthorized_and_transport_are_retryable() {
        assert!(ApiError::Unauthorized {
            url: "u".to_string()
        }
        .is_retryable());
        assert!(!ApiError::Rejected {
            url: "u".to_string(),
            message: "nope".to_string()
        }
        .is_retryable());
    }
}
