//! Customer environments and their signing contexts, loaded once at startup.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::info;

use crate::config::{ContextConfig, EnvironmentConfig};
use crate::pki::Signer;
use crate::pki::authority::validate_certificate_pem;
use crate::{Error, Result};

/// One signing authority and the clusters that trust it.
#[derive(Debug)]
pub struct SigningContext {
    signer: Signer,
    cluster_ca_pem: Vec<u8>,
    clusters: BTreeMap<String, String>,
}

impl SigningContext {
    /// Build a context from in-memory PEM material.
    ///
    /// `cluster_ca_pem` defaults to the signing CA certificate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the CA certificate or key cannot be used
    /// for signing, or if the cluster CA is not a single certificate.
    pub fn from_pem(
        ca_cert_pem: &[u8],
        ca_key_pem: &[u8],
        cluster_ca_pem: Option<&[u8]>,
        clusters: BTreeMap<String, String>,
    ) -> Result<Self> {
        let signer = Signer::from_pem(ca_cert_pem, ca_key_pem)
            .map_err(|e| Error::Config(e.to_string()))?;
        if let Some(pem) = cluster_ca_pem {
            validate_certificate_pem(pem).map_err(|e| Error::Config(format!("cluster CA: {e}")))?;
        }
        Ok(Self {
            signer,
            cluster_ca_pem: cluster_ca_pem.unwrap_or(ca_cert_pem).to_vec(),
            clusters,
        })
    }

    fn load(config: &ContextConfig) -> Result<Self> {
        let ca_cert = read_pem(&config.cacert)?;
        let ca_key = read_pem(&config.privkey)?;
        let cluster_ca = config.caclustercert.as_deref().map(read_pem).transpose()?;

        Self::from_pem(&ca_cert, &ca_key, cluster_ca.as_deref(), config.clusters.clone())
            .map_err(|e| Error::Config(format!("{}: {e}", config.cacert.display())))
    }

    /// Signer for this context.
    #[must_use]
    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// CA certificate the clusters present, as PEM.
    #[must_use]
    pub fn cluster_ca_pem(&self) -> &[u8] {
        &self.cluster_ca_pem
    }

    /// Cluster name → API server URL.
    #[must_use]
    pub fn clusters(&self) -> &BTreeMap<String, String> {
        &self.clusters
    }
}

/// A customer environment.
#[derive(Debug)]
pub struct Environment {
    /// Optional display name
    pub name: String,
    /// Customer identifier
    pub customer: String,
    /// Environment identifier
    pub environment: String,
    contexts: Vec<SigningContext>,
}

impl Environment {
    /// Assemble an environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when `contexts` is empty.
    pub fn new(
        customer: impl Into<String>,
        environment: impl Into<String>,
        contexts: Vec<SigningContext>,
    ) -> Result<Self> {
        let (customer, environment) = (customer.into(), environment.into());
        if contexts.is_empty() {
            return Err(Error::Config(format!(
                "environment {customer}/{environment} has no contexts"
            )));
        }
        Ok(Self {
            name: String::new(),
            customer,
            environment,
            contexts,
        })
    }

    /// The context that signs every request.
    #[must_use]
    pub fn primary(&self) -> &SigningContext {
        &self.contexts[0]
    }

    /// All contexts, primary first.
    #[must_use]
    pub fn contexts(&self) -> &[SigningContext] {
        &self.contexts
    }
}

/// Lookup table of configured environments.
#[derive(Debug, Default)]
pub struct Environments {
    environments: Vec<Environment>,
}

impl Environments {
    /// Wrap already-built environments.
    #[must_use]
    pub fn new(environments: Vec<Environment>) -> Self {
        Self { environments }
    }

    /// Read every context's certificate material.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on the first file that is missing or unusable.
    pub fn load(configs: &[EnvironmentConfig]) -> Result<Self> {
        let mut environments = Vec::with_capacity(configs.len());
        for config in configs {
            let contexts = config
                .contexts
                .iter()
                .map(SigningContext::load)
                .collect::<Result<Vec<_>>>()?;
            let mut environment = Environment::new(&config.customer, &config.environment, contexts)?;
            environment.name.clone_from(&config.name);
            info!(
                customer = %environment.customer,
                environment = %environment.environment,
                contexts = environment.contexts.len(),
                "Loaded environment"
            );
            environments.push(environment);
        }
        Ok(Self { environments })
    }

    /// First environment matching `customer` and `environment`.
    #[must_use]
    pub fn find(&self, customer: &str, environment: &str) -> Option<&Environment> {
        self.environments
            .iter()
            .find(|e| e.customer == customer && e.environment == environment)
    }

    /// Number of environments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.environments.len()
    }

    /// Whether no environment is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}
