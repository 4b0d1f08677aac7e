//! Configuration management
//!
//! The issuing server is configured from a YAML file merged with
//! `KUBETOKEN_`-prefixed environment variables (`__` separates nesting levels,
//! e.g. `KUBETOKEN_DIRECTORY__HOST=dc1.example.com`).

use std::{collections::BTreeMap, env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP listener
    pub server: ServerConfig,
    /// Directory (Active Directory) connection and layout
    pub directory: DirectoryConfig,
    /// Step-up authentication provider
    pub step_up: StepUpConfig,
    /// Customer environments and their signing contexts
    pub environments: Vec<EnvironmentConfig>,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Directory layout and connection settings.
///
/// Every distinguished name the server builds is derived from these fields,
/// so two servers (or two tests) with different layouts can coexist in one
/// process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Directory host name
    pub host: String,
    /// Directory port (636 for LDAPS)
    pub port: u16,
    /// Connect with TLS from the start (`ldaps://`)
    pub tls: bool,
    /// Base DN, e.g. `DC=example,DC=com`
    pub search_base: String,
    /// OU holding regular user accounts, relative to `search_base`
    pub user_ou: String,
    /// OU holding bot accounts, relative to `search_base`
    pub bot_ou: String,
    /// Username suffix that routes an account to `bot_ou`
    pub bot_suffix: String,
    /// OU searched for role groups, relative to `search_base`
    pub group_ou: String,
    /// OU holding the access groups a role DN points at, relative to `search_base`
    pub access_ou: String,
    /// Comma-separated group name prefixes, e.g. `kube,kubeops`
    pub search_groups: String,
    /// Connect/operation timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 636,
            tls: true,
            search_base: "DC=example,DC=com".to_string(),
            user_ou: "OU=people".to_string(),
            bot_ou: "OU=bots,OU=people".to_string(),
            bot_suffix: "-bot".to_string(),
            group_ou: "OU=groups".to_string(),
            access_ou: "OU=access,OU=groups".to_string(),
            search_groups: "kube".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl DirectoryConfig {
    /// Configured group prefixes, in order, without empty entries.
    #[must_use]
    pub fn group_prefixes(&self) -> Vec<&str> {
        self.search_groups
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    }
}

/// Step-up (second factor) provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepUpConfig {
    /// Require step-up approval before signing
    pub enabled: bool,
    /// Provider API base URL, e.g. `https://api-1234.duosecurity.com`
    pub api_url: String,
    /// Integration key (supports `env:VAR_NAME`)
    pub integration_key: String,
    /// Secret key (supports `env:VAR_NAME`)
    pub secret_key: String,
    /// Timeout for the (blocking) approval call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StepUpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: String::new(),
            integration_key: String::new(),
            secret_key: String::new(),
            timeout: Duration::from_secs(75),
        }
    }
}

impl StepUpConfig {
    /// Integration key with `env:` references expanded.
    #[must_use]
    pub fn resolve_integration_key(&self) -> String {
        resolve_secret(&self.integration_key)
    }

    /// Secret key with `env:` references expanded.
    #[must_use]
    pub fn resolve_secret_key(&self) -> String {
        resolve_secret(&self.secret_key)
    }
}

/// One customer environment
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// Optional display name
    #[serde(default)]
    pub name: String,
    /// Customer identifier (second segment of a role name)
    pub customer: String,
    /// Environment identifier (fourth segment of a role name)
    #[serde(rename = "env")]
    pub environment: String,
    /// Signing contexts; the first one signs every request
    pub contexts: Vec<ContextConfig>,
}

/// One signing authority and the clusters that trust it
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContextConfig {
    /// Path to the PEM CA certificate used for signing
    pub cacert: PathBuf,
    /// Path to the PEM CA private key
    pub privkey: PathBuf,
    /// Path to the PEM CA certificate of the clusters (defaults to `cacert`)
    #[serde(default)]
    pub caclustercert: Option<PathBuf>,
    /// Cluster name → API server URL
    #[serde(default)]
    pub clusters: BTreeMap<String, String>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("KUBETOKEN_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the server cannot serve.
    fn validate(&self) -> Result<()> {
        for env in &self.environments {
            if env.contexts.is_empty() {
                return Err(Error::Config(format!(
                    "environment {}/{} has no contexts",
                    env.customer, env.environment
                )));
            }
        }
        if self.directory.group_prefixes().is_empty() {
            return Err(Error::Config(
                "directory.search_groups names no group prefix".to_string(),
            ));
        }
        if self.step_up.enabled && self.step_up.api_url.is_empty() {
            return Err(Error::Config(
                "step_up.enabled requires step_up.api_url".to_string(),
            ));
        }
        Ok(())
    }
}

fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}
