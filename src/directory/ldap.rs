//! LDAPS binding for [`Directory`](super::Directory) using `ldap3`.

use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use tracing::debug;

use super::{DirectoryConn, DirectoryConnector, DirectoryEntry, DirectoryError, SearchRequest};
use crate::config::DirectoryConfig;

/// Connects to a directory server over LDAP(S).
#[derive(Debug, Clone)]
pub struct LdapConnector {
    url: String,
    timeout: Duration,
}

impl LdapConnector {
    /// Build a connector from the directory configuration.
    #[must_use]
    pub fn from_config(config: &DirectoryConfig) -> Self {
        let scheme = if config.tls { "ldaps" } else { "ldap" };
        Self {
            url: format!("{scheme}://{}:{}", config.host, config.port),
            timeout: config.timeout,
        }
    }

    /// Server URL this connector dials.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DirectoryConnector for LdapConnector {
    async fn bind(&self, bind_dn: &str, password: &str) -> Result<Box<dyn DirectoryConn>, DirectoryError> {
        let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.url)
            .await
            .map_err(|e| DirectoryError::Bind(format!("{}: {e}", self.url)))?;
        ldap3::drive!(conn);

        ldap.with_timeout(self.timeout)
            .simple_bind(bind_dn, password)
            .await
            .and_then(ldap3::LdapResult::success)
            .map_err(|e| DirectoryError::Bind(format!("{bind_dn}: {e}")))?;

        debug!(url = %self.url, bind_dn = %bind_dn, "Directory bind succeeded");
        Ok(Box::new(LdapConn {
            ldap,
            timeout: self.timeout,
        }))
    }
}

/// A bound `ldap3` handle.
struct LdapConn {
    ldap: Ldap,
    timeout: Duration,
}

#[async_trait]
impl DirectoryConn for LdapConn {
    async fn search(&mut self, request: &SearchRequest) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let (entries, _result) = self
            .ldap
            .with_timeout(self.timeout)
            .search(&request.base, Scope::Subtree, &request.filter, &request.attrs)
            .await
            .and_then(ldap3::SearchResult::success)
            .map_err(|e| DirectoryError::Search(format!("{}: {e}", request.filter)))?;

        Ok(entries
            .into_iter()
            .map(SearchEntry::construct)
            .map(|entry| DirectoryEntry {
                dn: entry.dn,
                attrs: entry.attrs.into_iter().collect(),
            })
            .collect())
    }

    async fn close(&mut self) {
        if let Err(e) = self.ldap.unbind().await {
            debug!(error = %e, "Directory unbind failed");
        }
    }
}
