//! Step-up (second factor) authentication.
//!
//! [`DuoAuthenticator`] pushes an approval request to the user's device through
//! the Duo Auth API and blocks until the user answers or the call times out.
//! Anything other than an explicit `allow` is a failure.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::Sha512;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::StepUpConfig;

const AUTH_PATH: &str = "/auth/v2/auth";
const USER_AGENT: &str = concat!("kubetoken/", env!("CARGO_PKG_VERSION"));

/// Step-up failures.
#[derive(Debug, Error)]
pub enum StepUpError {
    /// The provider could not be reached
    #[error("step-up transport error: {0}")]
    Transport(String),

    /// The provider answered with a non-200 status
    #[error("expected 200, got {status}: {body}")]
    Status {
        /// HTTP status
        status: u16,
        /// Response body
        body: String,
    },

    /// The provider answered 200 but `stat` was not `OK`
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// The user (or provider policy) did not approve
    #[error("request denied: {status}: {message}")]
    Denied {
        /// Provider status code, e.g. `deny`
        status: String,
        /// Provider message
        message: String,
    },

    /// The response body could not be decoded
    #[error("step-up response decode error: {0}")]
    Decode(String),
}

impl StepUpError {
    /// Whether the failure came from the provider rather than the user's answer.
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        !matches!(self, Self::Denied { .. })
    }
}

/// Approves or rejects a principal before a certificate is signed.
#[async_trait]
pub trait StepUpAuthenticator: Send + Sync {
    /// Ask the principal to approve; `Ok(())` only on explicit approval.
    async fn authenticate(&self, principal: &str) -> Result<(), StepUpError>;
}

/// Duo Auth API client.
#[derive(Debug, Clone)]
pub struct DuoAuthenticator {
    http: reqwest::Client,
    api_url: Url,
    integration_key: String,
    secret_key: String,
}

impl DuoAuthenticator {
    /// Build from configuration, resolving `env:` secrets.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the API URL is invalid or the
    /// HTTP client cannot be built.
    pub fn from_config(config: &StepUpConfig) -> crate::Result<Self> {
        let api_url = Url::parse(&config.api_url)
            .map_err(|e| crate::Error::Config(format!("step_up.api_url: {e}")))?;
        if api_url.host_str().is_none() {
            return Err(crate::Error::Config(
                "step_up.api_url has no host".to_string(),
            ));
        }

        Ok(Self {
            http: build_client(config.timeout)?,
            api_url,
            integration_key: config.resolve_integration_key(),
            secret_key: config.resolve_secret_key(),
        })
    }

    fn host(&self) -> String {
        let host = self.api_url.host_str().unwrap_or_default().to_lowercase();
        match self.api_url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        }
    }
}

fn build_client(timeout: Duration) -> crate::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| crate::Error::Config(format!("step-up HTTP client: {e}")))
}

#[async_trait]
impl StepUpAuthenticator for DuoAuthenticator {
    async fn authenticate(&self, principal: &str) -> Result<(), StepUpError> {
        let params = [
            ("device", "auto"),
            ("factor", "auto"),
            ("username", principal),
        ];
        let body = canonical_params(&params);
        let date = chrono::Utc::now().to_rfc2822();
        let signature = sign_request(
            &self.secret_key,
            &date,
            "POST",
            &self.host(),
            AUTH_PATH,
            &body,
        )?;
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{signature}", self.integration_key));

        let url = self
            .api_url
            .join(AUTH_PATH)
            .map_err(|e| StepUpError::Transport(e.to_string()))?;

        debug!(user = %principal, url = %url, "Requesting step-up approval");
        let response = self
            .http
            .post(url)
            .header(reqwest::header::DATE, &date)
            .header(reqwest::header::AUTHORIZATION, format!("Basic {credentials}"))
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body)
            .send()
            .await
            .map_err(|e| StepUpError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StepUpError::Transport(e.to_string()))?;

        match evaluate_response(status, &body) {
            Ok(()) => {
                info!(user = %principal, "Step-up approved");
                Ok(())
            }
            Err(e) => {
                warn!(user = %principal, error = %e, "Step-up not approved");
                Err(e)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthEnvelope {
    stat: String,
    #[serde(default)]
    response: AuthResponse,
}

#[derive(Debug, Default, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    result: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    status_msg: String,
}

/// Decide whether a provider response approves the request.
///
/// # Errors
///
/// Every response other than a 200 with `stat == "OK"` and
/// `result == "allow"` is an error.
pub fn evaluate_response(status: StatusCode, body: &str) -> Result<(), StepUpError> {
    if status != StatusCode::OK {
        return Err(StepUpError::Status {
            status: status.as_u16(),
            body: body.to_string(),
        });
    }

    let envelope: AuthEnvelope =
        serde_json::from_str(body).map_err(|e| StepUpError::Decode(e.to_string()))?;
    if envelope.stat != "OK" {
        return Err(StepUpError::RequestFailed(body.to_string()));
    }
    if envelope.response.result != "allow" {
        return Err(StepUpError::Denied {
            status: envelope.response.status,
            message: envelope.response.status_msg,
        });
    }
    Ok(())
}

/// Sorted `key=value` pairs joined with `&`, RFC 3986 encoded.
fn canonical_params(params: &[(&str, &str)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// HMAC-SHA512 over the canonical request, hex encoded.
fn sign_request(
    secret_key: &str,
    date: &str,
    method: &str,
    host: &str,
    path: &str,
    params: &str,
) -> Result<String, StepUpError> {
    use hmac::{KeyInit, Mac};

    let canonical = [date, &method.to_uppercase(), &host.to_lowercase(), path, params].join("\n");
    let mut mac = hmac::Hmac::<Sha512>::new_from_slice(secret_key.as_bytes())
        .map_err(|e| StepUpError::Transport(format!("invalid secret key: {e}")))?;
    mac.update(canonical.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
