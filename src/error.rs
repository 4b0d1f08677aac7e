//! Error types for kubetoken

use std::io;

use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

use crate::directory::DirectoryError;
use crate::pki::PkiError;
use crate::role::RoleParseError;
use crate::step_up::StepUpError;

/// Result type alias for kubetoken
pub type Result<T> = std::result::Result<T, Error>;

/// kubetoken errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or malformed transport credentials
    #[error("Authentication required: {0}")]
    Authentication(String),

    /// Certificate request subject does not match the authenticated user
    #[error("Subject.CommonName {subject:?} does not match auth username {user:?}")]
    IdentityMismatch {
        /// Common name carried by the request
        subject: String,
        /// Username from basic authentication
        user: String,
    },

    /// Malformed request payload (PEM, CSR)
    #[error("{0}")]
    Parse(String),

    /// Role could not be resolved into customer/namespace/environment
    #[error(transparent)]
    Role(#[from] RoleParseError),

    /// Directory denied the role or could not be queried
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Step-up authentication did not approve the request
    #[error(transparent)]
    StepUp(#[from] StepUpError),

    /// No environment configured for the role's customer/environment
    #[error("{role}: no known environment")]
    EnvironmentNotFound {
        /// The requested role
        role: String,
    },

    /// Certificate generation or signing failed
    #[error(transparent)]
    Pki(#[from] PkiError),

    /// Unexpected response from the issuance server
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status reported to the caller for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::IdentityMismatch { .. } | Self::Directory(_) | Self::StepUp(_) => {
                StatusCode::FORBIDDEN
            }
            Self::Parse(_) | Self::EnvironmentNotFound { .. } => StatusCode::BAD_REQUEST,
            Self::Role(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message sent back to the caller.
    ///
    /// Upstream failures (directory bind/search, step-up transport) are reported
    /// as a plain authorization failure; the detail only goes to the log.
    fn public_message(&self) -> String {
        match self {
            Self::Directory(e) if e.is_upstream() => "directory authorization failed".to_string(),
            Self::StepUp(e) if e.is_upstream() => "step-up authentication failed".to_string(),
            Self::Pki(_) | Self::Internal(_) | Self::Io(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        } else {
            warn!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let mut response = (status, self.public_message()).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static(r#"Basic realm="Restricted""#),
            );
        }
        response
    }
}
