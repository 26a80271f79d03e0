//! HTTP transport implementation.
//!
//! JSON over HTTP against the remote contract:
//!
//! ```text
//! POST {base}/sync/push              body: PushRequest  -> PushResponse
//! GET  {base}/sync/pull?since=&limit=                   -> PullResponse
//! ```

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use async_trait::async_trait;
use ledgersync_sync_protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

/// HTTP-based sync transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl HttpTransport {
    /// Creates a transport with a default client.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Network`] if the TLS backend cannot initialize.
    pub fn new(base_url: impl Into<String>) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| SyncError::network_fatal(err.to_string()))?;
        Ok(Self::with_client(base_url, client))
    }

    /// Creates a transport over an existing client.
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            bearer_token: None,
        }
    }

    /// Sends `token` as a bearer credential on every request.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> SyncResult<T> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if let Some(err) = status_error(status, &body) {
            return Err(err);
        }

        serde_json::from_str(&body)
            .map_err(|err| SyncError::Protocol(format!("failed to decode response: {err}")))
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        let url = format!("{}/sync/push", self.base_url);
        self.execute(self.client.post(url).json(request)).await
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        let url = format!("{}/sync/pull", self.base_url);
        let limit = request.limit.to_string();
        let query = [("since", request.since.as_str()), ("limit", limit.as_str())];
        self.execute(self.client.get(url).query(&query)).await
    }
}

fn transport_error(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout
    } else if err.is_builder() {
        SyncError::network_fatal(err.to_string())
    } else {
        SyncError::network_retryable(err.to_string())
    }
}

/// Maps a non-success status to an error.
///
/// 401/403 are auth failures; 408, 429 and 5xx are transient; any other 4xx
/// is permanent.
pub(crate) fn status_error(status: StatusCode, body: &str) -> Option<SyncError> {
    if status.is_success() {
        return None;
    }

    let message = describe(status, body);
    Some(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Auth(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SyncError::network_retryable(message)
        }
        status if status.is_server_error() => SyncError::network_retryable(message),
        _ => SyncError::network_fatal(message),
    })
}

fn describe(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value
            .get("error")
            .or_else(|| value.get("message"))
            .and_then(|v| v.as_str())
        {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_not_an_error() {
        assert!(status_error(StatusCode::OK, "").is_none());
    }

    #[test]
    fn auth_statuses() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            assert!(matches!(status_error(status, ""), Some(SyncError::Auth(_))));
        }
    }

    #[test]
    fn transient_statuses_are_retryable() {
        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(status_error(status, "").is_some_and(|err| err.is_retryable()));
        }
    }

    #[test]
    fn other_client_errors_are_permanent() {
        let err = status_error(StatusCode::UNPROCESSABLE_ENTITY, "bad payload").unwrap();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("bad payload (422)"));
    }

    #[test]
    fn json_error_bodies_are_unwrapped() {
        let err = status_error(StatusCode::BAD_REQUEST, r#"{"error": "missing changes"}"#).unwrap();
        assert!(err.to_string().contains("missing changes (400)"));
    }

    #[test]
    fn base_url_is_normalized() {
        let transport = HttpTransport::with_client("https://sync.example.com/", reqwest::Client::new());
        assert_eq!(transport.base_url(), "https://sync.example.com");
    }
}
