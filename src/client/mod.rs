//! Issuing server client
//!
//! [`IssuanceClient::request_certificate`] generates a key and certificate
//! request locally, submits it, and follows step-up redirects until the
//! server gives a final answer. The private key never leaves this process.

pub mod contexts;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

use crate::pki;
use crate::protocol::{
    CertificateResponse, ROLES_PATH, RolesResponse, SIGN_CSR_PATH, STEP_UP_STATUS, key_file,
};
use crate::{Error, Result};

pub use contexts::{BundlePaths, ContextPlan, KubeContext, plan_contexts, write_bundle};

/// Default bound on step-up redirects per request.
pub const DEFAULT_MAX_STEP_UP_ROUNDS: u32 = 3;

/// Default bound on a whole signing exchange, step-up waits included.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// Called each time the server asks for step-up approval.
pub type StepUpNotice = Arc<dyn Fn(&Url) + Send + Sync>;

/// Progress of one signing exchange.
enum Submission {
    /// Request about to be sent to `url`; `rounds` redirects followed so far.
    Submitted { url: Url, rounds: u32 },
    /// Server asked for step-up; the request will be resent to `url`.
    AwaitingStepUp { url: Url, rounds: u32 },
    /// Final outcome.
    Terminal(Result<CertificateResponse>),
}

/// Client for the issuing server.
#[derive(Clone)]
pub struct IssuanceClient {
    http: Client,
    base: Url,
    user: String,
    password: String,
    max_step_up_rounds: u32,
    timeout: Duration,
    step_up_notice: StepUpNotice,
}

impl fmt::Debug for IssuanceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuanceClient")
            .field("base", &self.base.as_str())
            .field("user", &self.user)
            .field("max_step_up_rounds", &self.max_step_up_rounds)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl IssuanceClient {
    /// Create a client for the server at `host` (e.g. `https://kubetoken.example.com`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `host` is not an absolute URL or the HTTP
    /// client cannot be built.
    pub fn new(host: &str, user: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let base = Url::parse(host).map_err(|e| Error::Config(format!("Invalid host {host:?}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!("Invalid host {host:?}")));
        }

        let http = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("kubetoken/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base,
            user: user.into(),
            password: password.into(),
            max_step_up_rounds: DEFAULT_MAX_STEP_UP_ROUNDS,
            timeout: DEFAULT_TIMEOUT,
            step_up_notice: Arc::new(|url: &Url| info!(url = %url, "Awaiting step-up approval")),
        })
    }

    /// Set the maximum number of step-up redirects followed per request.
    #[must_use]
    pub fn with_max_step_up_rounds(mut self, rounds: u32) -> Self {
        self.max_step_up_rounds = rounds;
        self
    }

    /// Set the overall timeout for one signing exchange.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the step-up notification (default: an `info` log line).
    #[must_use]
    pub fn with_step_up_notice(mut self, notice: impl Fn(&Url) + Send + Sync + 'static) -> Self {
        self.step_up_notice = Arc::new(notice);
        self
    }

    /// Username requests are made for.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid endpoint {path}: {e}")))
    }

    /// List the roles the user may request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on any non-200 answer.
    pub async fn fetch_roles(&self) -> Result<Vec<String>> {
        let response = self
            .http
            .get(self.endpoint(ROLES_PATH)?)
            .basic_auth(&self.user, Some(&self.password))
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Protocol(format!("remote server replied: {status}\n{body}")));
        }
        let roles: RolesResponse = response.json().await?;
        Ok(roles.roles)
    }

    /// Version string reported by the server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on any non-200 answer.
    pub async fn remote_version(&self) -> Result<String> {
        let url = self.endpoint("/version")?;
        let response = self.http.get(url.clone()).timeout(self.timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Protocol(format!("unexpected status code fetching {url}: {status}")));
        }
        Ok(response.text().await?.trim().to_string())
    }

    /// Generate a key pair, have the server sign it for `role`, and return
    /// the response with the private key added as `{user}-key.pem`.
    ///
    /// # Errors
    ///
    /// Any failure of key generation, transport, or the server's answer.
    pub async fn request_certificate(&self, role: &str) -> Result<CertificateResponse> {
        let csr = pki::new_csr(&self.user, role)?;
        let mut result = self.submit_csr(csr.csr_pem.as_bytes()).await?;
        verify_response(&result, &self.user, role)?;
        result
            .files
            .insert(key_file(&self.user), csr.key_pem.into_bytes());
        Ok(result)
    }

    /// Submit a PEM certificate request, following step-up redirects.
    ///
    /// The exchange is bounded by `max_step_up_rounds` redirects and by the
    /// overall timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for non-200 answers, too many redirects, a
    /// redirect to another origin, or a timeout.
    pub async fn submit_csr(&self, csr_pem: &[u8]) -> Result<CertificateResponse> {
        tokio::time::timeout(self.timeout, self.drive(csr_pem))
            .await
            .map_err(|_| {
                Error::Protocol(format!(
                    "no final answer within {}s",
                    self.timeout.as_secs()
                ))
            })?
    }

    async fn drive(&self, csr_pem: &[u8]) -> Result<CertificateResponse> {
        let mut state = Submission::Submitted {
            url: self.endpoint(SIGN_CSR_PATH)?,
            rounds: 0,
        };

        loop {
            state = match state {
                Submission::Submitted { url, rounds } => self.send(url, rounds, csr_pem).await,
                Submission::AwaitingStepUp { url, rounds } => {
                    (self.step_up_notice)(&url);
                    Submission::Submitted { url, rounds }
                }
                Submission::Terminal(result) => return result,
            };
        }
    }

    async fn send(&self, url: Url, rounds: u32, csr_pem: &[u8]) -> Submission {
        debug!(url = %url, round = rounds, "Submitting certificate request");
        let response = match self
            .http
            .post(url.clone())
            .basic_auth(&self.user, Some(&self.password))
            .header(reqwest::header::CONTENT_TYPE, "application/x-pem-file")
            .body(csr_pem.to_vec())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Submission::Terminal(Err(e.into())),
        };

        let status = response.status();
        if status.is_success() {
            return Submission::Terminal(response.json().await.map_err(Error::from));
        }

        if status.as_u16() == STEP_UP_STATUS {
            if rounds >= self.max_step_up_rounds {
                return Submission::Terminal(Err(Error::Protocol(format!(
                    "gave up after {rounds} step-up redirects"
                ))));
            }
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            return match resolve_location(&url, location) {
                Ok(next) => Submission::AwaitingStepUp {
                    url: next,
                    rounds: rounds + 1,
                },
                Err(e) => Submission::Terminal(Err(e)),
            };
        }

        let body = response.text().await.unwrap_or_default();
        Submission::Terminal(Err(Error::Protocol(format!(
            "expected 200, got {status}\n{}",
            body.trim_end()
        ))))
    }
}

/// Resolve a step-up `Location` against the URL that produced it.
///
/// Only same-origin targets are followed: the request carries the user's
/// password.
fn resolve_location(current: &Url, location: &str) -> Result<Url> {
    if location.is_empty() {
        return Err(Error::Protocol("step-up response without Location".to_string()));
    }
    let next = current
        .join(location)
        .map_err(|e| Error::Protocol(format!("invalid step-up Location {location:?}: {e}")))?;
    if next.origin() != current.origin() {
        return Err(Error::Protocol(format!(
            "refusing step-up redirect to another origin: {next}"
        )));
    }
    Ok(next)
}

/// Check that a signing response is for the identity and role that were
/// requested; both end up in local file paths.
fn verify_response(result: &CertificateResponse, user: &str, role: &str) -> Result<()> {
    if result.username != user {
        return Err(Error::Protocol(format!(
            "response is for user {:?}, requested {user:?}",
            result.username
        )));
    }
    if result.role != role {
        return Err(Error::Protocol(format!(
            "response is for role {:?}, requested {role:?}",
            result.role
        )));
    }
    Ok(())
}

/// Keep the roles matching `filter`, sorted.
///
/// # Errors
///
/// Returns [`Error::Config`] if `filter` is not a valid regular expression.
pub fn filter_roles(roles: Vec<String>, filter: &str) -> Result<Vec<String>> {
    let re = Regex::new(filter).map_err(|e| Error::Config(format!("Invalid filter: {e}")))?;
    let mut roles: Vec<String> = roles.into_iter().filter(|r| re.is_match(r)).collect();
    roles.sort();
    Ok(roles)
}
