//! HTTP plumbing shared by the upstream clients.

use std::time::Duration;

use reqwest::StatusCode;
use url::Url;

use electa_core::error::{UpstreamError, UpstreamResult};

/// Connection settings for an upstream service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub base_url: Url,
    /// Sent as `x-service-token` on every request when set.
    pub service_token: Option<String>,
    pub timeout: Duration,
}

impl ServiceConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            service_token: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_service_token(mut self, token: impl Into<String>) -> Self {
        self.service_token = Some(token.into());
        self
    }
}

pub(crate) fn build_client(config: &ServiceConfig) -> UpstreamResult<reqwest::Client> {
    if config.base_url.cannot_be_a_base() {
        return Err(UpstreamError::InvalidResponse(format!(
            "{} cannot be used as a base URL",
            config.base_url
        )));
    }
    reqwest::Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(|e| UpstreamError::Unavailable(e.to_string()))
}

/// Append percent-encoded path segments to the base URL.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

pub(crate) fn transport_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout(e.to_string())
    } else {
        UpstreamError::Unavailable(e.to_string())
    }
}

/// Decode a JSON response. `Ok(None)` when `absent` matches the status.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    absent: &[StatusCode],
) -> UpstreamResult<Option<T>> {
    let status = response.status();
    if absent.contains(&status) {
        return Ok(None);
    }
    if status.is_server_error() {
        return Err(UpstreamError::Unavailable(format!("status {status}")));
    }
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(UpstreamError::Rejected {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json::<T>()
        .await
        .map(Some)
        .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))
}
