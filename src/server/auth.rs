//! HTTP Basic authentication
//!
//! The middleware only checks that credentials are present and well formed.
//! The password itself is verified by the directory, which the handlers bind
//! to as the user.

use std::fmt;

use axum::{
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use tracing::{debug, warn};

use crate::Error;

/// Username and password taken from the `Authorization` header.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl BasicCredentials {
    /// Parse an `Authorization: Basic ...` header value.
    #[must_use]
    pub fn from_header(value: &str) -> Option<Self> {
        let (scheme, encoded) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Basic authentication middleware
///
/// Inserts [`BasicCredentials`] into the request extensions, or answers 401
/// with a `WWW-Authenticate` challenge.
pub async fn basic_auth_middleware(mut request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let credentials = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(BasicCredentials::from_header);

    let Some(credentials) = credentials else {
        warn!(path = %path, "Missing or malformed Authorization header");
        return Error::Authentication("Authentication required".to_string()).into_response();
    };

    debug!(user = %credentials.username, path = %path, "Basic credentials present");
    request.extensions_mut().insert(credentials);
    next.run(request).await
}
