//! Role naming convention.
//!
//! Access groups are named `kube-{customer}-{namespace}-{environment}-dl-{role}`,
//! e.g. `kube-acme-default-dev-dl-admin`. Each segment is one or more ASCII word
//! characters. The group name doubles as the certificate Organization, so the
//! issuing server can recover which environment a request targets.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Errors returned by [`Role::parse`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoleParseError {
    /// The string does not follow the role naming convention.
    #[error("no match for role {0:?}")]
    NoMatch(String),

    /// The request carried no role at all.
    #[error("certificate request has no Organization role")]
    Missing,
}

/// A parsed access role.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Role {
    /// Customer identifier.
    pub customer: String,
    /// Kubernetes namespace the role grants access to.
    pub namespace: String,
    /// Environment name (e.g. `dev`, `prod`).
    pub environment: String,
    /// Base role within the namespace (e.g. `admin`).
    pub base_role: String,
}

fn role_pattern() -> &'static Regex {
    static ROLE_RE: OnceLock<Regex> = OnceLock::new();
    ROLE_RE.get_or_init(|| {
        Regex::new(
            r"^kube-(?P<customer>[0-9A-Za-z_]+)-(?P<namespace>[0-9A-Za-z_]+)-(?P<environment>[0-9A-Za-z_]+)-dl-(?P<role>[0-9A-Za-z_]+)$",
        )
        .expect("role pattern is a valid regex")
    })
}

impl Role {
    /// Parse a role name into its components.
    ///
    /// The match is exact: no trimming or case folding is applied.
    pub fn parse(role: &str) -> Result<Self, RoleParseError> {
        let caps = role_pattern()
            .captures(role)
            .ok_or_else(|| RoleParseError::NoMatch(role.to_string()))?;

        let segment = |name: &str| {
            caps.name(name)
                .map(|m| m.as_str().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| RoleParseError::NoMatch(role.to_string()))
        };

        Ok(Self {
            customer: segment("customer")?,
            namespace: segment("namespace")?,
            environment: segment("environment")?,
            base_role: segment("role")?,
        })
    }
}

impl FromStr for Role {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kube-{}-{}-{}-dl-{}",
            self.customer, self.namespace, self.environment, self.base_role
        )
    }
}
