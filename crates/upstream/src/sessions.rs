//! Session verification against the auth service.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument};

use electa_core::error::UpstreamResult;
use electa_core::ports::{ADMIN_ROLE, Principal, SessionVerifier};

use crate::client::{ServiceConfig, build_client, endpoint, read_json, transport_error};

/// [`SessionVerifier`] calling `GET {auth}/sessions/current` with the
/// caller's bearer token.
pub struct HttpSessionVerifier {
    config: ServiceConfig,
    http: reqwest::Client,
}

impl HttpSessionVerifier {
    pub fn new(config: ServiceConfig) -> UpstreamResult<Self> {
        let http = build_client(&config)?;
        Ok(Self { config, http })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    #[serde(alias = "id")]
    user_id: String,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    role: Option<String>,
}

impl SessionPayload {
    fn into_principal(self) -> Principal {
        let mut roles = self.roles;
        if let Some(role) = self.role
            && !roles.contains(&role)
        {
            roles.push(role);
        }
        Principal {
            account_id: self.user_id.into(),
            roles,
        }
    }
}

#[async_trait]
impl SessionVerifier for HttpSessionVerifier {
    #[instrument(skip_all)]
    async fn verify(&self, token: &str) -> UpstreamResult<Option<Principal>> {
        let mut request = self
            .http
            .get(endpoint(&self.config.base_url, &["sessions", "current"]))
            .bearer_auth(token);
        if let Some(service_token) = &self.config.service_token {
            request = request.header("x-service-token", service_token);
        }
        let response = request.send().await.map_err(transport_error)?;

        let payload = read_json::<SessionPayload>(
            response,
            &[StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN, StatusCode::NOT_FOUND],
        )
        .await?;
        if payload.is_none() {
            debug!("Session rejected by auth service");
        }
        Ok(payload.map(SessionPayload::into_principal))
    }
}

/// Development verifier accepting `demo:<user>` and `demo:<user>:admin` tokens.
///
/// Only wired in demo mode.
#[derive(Debug, Default, Clone)]
pub struct DemoSessionVerifier;

impl DemoSessionVerifier {
    fn parse(token: &str) -> Option<Principal> {
        let rest = token.strip_prefix("demo:")?;
        let (user, role) = match rest.split_once(':') {
            Some((user, role)) => (user, Some(role)),
            None => (rest, None),
        };
        if user.is_empty() {
            return None;
        }
        let roles = match role {
            Some(ADMIN_ROLE) => vec![ADMIN_ROLE.to_string()],
            Some(_) => return None,
            None => Vec::new(),
        };
        Some(Principal {
            account_id: user.into(),
            roles,
        })
    }
}

#[async_trait]
impl SessionVerifier for DemoSessionVerifier {
    async fn verify(&self, token: &str) -> UpstreamResult<Option<Principal>> {
        Ok(Self::parse(token))
    }
}
