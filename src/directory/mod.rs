//! Active Directory flavoured role lookup and validation.
//!
//! Two query shapes are needed:
//!
//! - [`Directory::fetch_roles_for_user`] lists every role group the user is a
//!   (transitive) member of.
//! - [`Directory::validate_role_for_user`] confirms the user is a (transitive)
//!   member of one specific role group.
//!
//! Both bind as the user, so the directory itself checks the password. The
//! network side sits behind [`DirectoryConnector`] / [`DirectoryConn`]; the
//! LDAPS implementation lives in [`ldap`].

pub mod ldap;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DirectoryConfig;

pub use ldap::LdapConnector;

/// Active Directory matching rule for transitive (nested) group membership.
pub const LDAP_MATCHING_RULE_IN_CHAIN: &str = "1.2.840.113556.1.4.1941";

/// Errors raised while authorizing against the directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The bind failed: bad credentials, unreachable server, TLS failure.
    #[error("directory bind failed: {0}")]
    Bind(String),

    /// The search request failed after a successful bind.
    #[error("directory search failed: {0}")]
    Search(String),

    /// The user is not a member of the role group.
    #[error("{user_dn} is not a member of {role_dn}")]
    NotAuthorized {
        /// DN searched under
        user_dn: String,
        /// Role group DN
        role_dn: String,
    },

    /// Exactly one entry matched, but it is not the requesting user.
    #[error("{user:?} is not a member of {role:?}; search returned {found:?}")]
    UnexpectedIdentity {
        /// Requesting user
        user: String,
        /// Requested role
        role: String,
        /// `cn` of the entry the search returned
        found: String,
    },

    /// More than one entry matched a search that must identify one person.
    #[error("got {count} entries for query {filter}: {entries:?}")]
    AmbiguousIdentity {
        /// Number of entries returned
        count: usize,
        /// Filter that produced them
        filter: String,
        /// DNs of the returned entries
        entries: Vec<String>,
    },
}

impl DirectoryError {
    /// `true` for failures of the directory itself rather than a denial.
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Bind(_) | Self::Search(_))
    }
}

/// A single search request: subtree scope, no alias dereferencing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Base DN
    pub base: String,
    /// LDAP filter
    pub filter: String,
    /// Attributes to return
    pub attrs: Vec<String>,
}

/// One entry returned by a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Entry DN
    pub dn: String,
    /// Attribute name → values
    pub attrs: Vec<(String, Vec<String>)>,
}

impl DirectoryEntry {
    /// First value of an attribute (attribute names compare case-insensitively).
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(String::as_str)
    }
}

/// Bound directory connection.
#[async_trait]
pub trait DirectoryConn: Send {
    /// Run a subtree search.
    async fn search(&mut self, request: &SearchRequest) -> Result<Vec<DirectoryEntry>, DirectoryError>;

    /// Release the connection.
    async fn close(&mut self);
}

/// Opens bound connections.
#[async_trait]
pub trait DirectoryConnector: Send + Sync + 'static {
    /// Connect and bind with the given DN and password.
    async fn bind(&self, bind_dn: &str, password: &str) -> Result<Box<dyn DirectoryConn>, DirectoryError>;
}

/// Role provider and validator over a directory.
pub struct Directory {
    config: DirectoryConfig,
    connector: Arc<dyn DirectoryConnector>,
}

impl Directory {
    /// Create a directory client for the given layout and connector.
    #[must_use]
    pub fn new(config: DirectoryConfig, connector: Arc<dyn DirectoryConnector>) -> Self {
        Self { config, connector }
    }

    /// Directory layout in use.
    #[must_use]
    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// DN template for a user: bots live in their own OU.
    fn user_ou(&self, user: &str) -> &str {
        if !self.config.bot_suffix.is_empty() && user.ends_with(&self.config.bot_suffix) {
            &self.config.bot_ou
        } else {
            &self.config.user_ou
        }
    }

    /// Distinguished name the user binds as.
    #[must_use]
    pub fn user_dn(&self, user: &str) -> String {
        format!(
            "CN={},{},{}",
            escape_dn(user),
            self.user_ou(user),
            self.config.search_base
        )
    }

    /// Distinguished name of a role's access group.
    #[must_use]
    pub fn role_dn(&self, role: &str) -> String {
        format!(
            "cn={},{},{}",
            escape_dn(role),
            self.config.access_ou,
            self.config.search_base
        )
    }

    /// Filter component matching role groups for every configured prefix.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Search`] when no prefix is configured, since
    /// an empty alternation is not a valid filter.
    pub fn group_filter(&self) -> Result<String, DirectoryError> {
        let groups: Vec<String> = self
            .config
            .group_prefixes()
            .into_iter()
            .map(|prefix| format!("cn={}-*-*-*-dl-*", ldap3::ldap_escape(prefix)))
            .collect();

        match groups.as_slice() {
            [] => Err(DirectoryError::Search(
                "no group prefixes configured".to_string(),
            )),
            [single] => Ok(single.clone()),
            _ => Ok(format!("|({})", groups.join(")("))),
        }
    }

    /// Search request listing the user's role groups.
    ///
    /// # Errors
    ///
    /// Fails like [`Directory::group_filter`].
    pub fn roles_request(&self, user: &str) -> Result<SearchRequest, DirectoryError> {
        Ok(SearchRequest {
            base: format!("{},{}", self.config.group_ou, self.config.search_base),
            filter: format!(
                "(&({})(member:{}:={}))",
                self.group_filter()?,
                LDAP_MATCHING_RULE_IN_CHAIN,
                ldap3::ldap_escape(&self.user_dn(user))
            ),
            attrs: vec!["cn".to_string()],
        })
    }

    /// Search request checking the user's membership of one role.
    #[must_use]
    pub fn validate_request(&self, user: &str, role: &str) -> SearchRequest {
        SearchRequest {
            base: self.user_dn(user),
            filter: format!(
                "(&(objectCategory=Person)(sAMAccountName=*)(memberOf:{}:={}))",
                LDAP_MATCHING_RULE_IN_CHAIN,
                ldap3::ldap_escape(&self.role_dn(role))
            ),
            attrs: vec!["cn".to_string()],
        }
    }

    /// Return every role group `user` belongs to, directly or through nesting.
    pub async fn fetch_roles_for_user(
        &self,
        user: &str,
        password: &str,
    ) -> Result<Vec<String>, DirectoryError> {
        let request = self.roles_request(user)?;
        let entries = self.run(user, password, &request).await?;

        let mut roles = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.attr("cn") {
                Some(cn) => roles.push(cn.to_string()),
                None => warn!(dn = %entry.dn, "Role group without cn attribute"),
            }
        }
        debug!(user = %user, roles = roles.len(), "Fetched roles");
        Ok(roles)
    }

    /// Check that `user` may assume `role`.
    pub async fn validate_role_for_user(
        &self,
        user: &str,
        password: &str,
        role: &str,
    ) -> Result<(), DirectoryError> {
        let request = self.validate_request(user, role);
        let entries = self.run(user, password, &request).await?;

        match entries.as_slice() {
            [] => Err(DirectoryError::NotAuthorized {
                user_dn: request.base,
                role_dn: self.role_dn(role),
            }),
            [entry] => {
                let cn = entry.attr("cn").unwrap_or_default();
                if cn == user {
                    Ok(())
                } else {
                    Err(DirectoryError::UnexpectedIdentity {
                        user: user.to_string(),
                        role: role.to_string(),
                        found: cn.to_string(),
                    })
                }
            }
            many => {
                warn!(user = %user, role = %role, count = many.len(), "Ambiguous directory identity");
                Err(DirectoryError::AmbiguousIdentity {
                    count: many.len(),
                    filter: request.filter,
                    entries: many.iter().map(|e| e.dn.clone()).collect(),
                })
            }
        }
    }

    /// Bind as `user`, run one search, and close the connection on every path.
    async fn run(
        &self,
        user: &str,
        password: &str,
        request: &SearchRequest,
    ) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        // An empty password is an anonymous bind, which most directories accept.
        if password.is_empty() {
            return Err(DirectoryError::Bind("empty password".to_string()));
        }

        let mut conn = self.connector.bind(&self.user_dn(user), password).await?;
        let result = conn.search(request).await;
        conn.close().await;
        result
    }
}

/// Escape a value for inclusion in a distinguished name.
///
/// Complements filter escaping: each of `/ \ # , ; < > + =` gets a backslash
/// in front of it.
#[must_use]
pub fn escape_dn(unsafe_value: &str) -> String {
    let mut escaped = String::with_capacity(unsafe_value.len());
    for c in unsafe_value.chars() {
        if matches!(c, '/' | '\\' | '#' | ',' | ';' | '<' | '>' | '+' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
