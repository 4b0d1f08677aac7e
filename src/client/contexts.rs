//! Turning a signing response into cluster connection contexts.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use url::Url;

use crate::protocol::{CA_FILE, CertificateResponse, cert_file, key_file};
use crate::role::Role;
use crate::{Error, Result};

/// One cluster connection context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeContext {
    /// `{role}/{cluster-name}/{username}`
    pub id: String,
    /// Cluster name as configured on the server
    pub cluster_name: String,
    /// Cluster entry name: the API server host
    pub cluster: String,
    /// API server URL
    pub server: String,
    /// Credentials entry name: `{role}/{username}`
    pub credentials: String,
    /// Namespace selected by the context
    pub namespace: String,
}

/// Every context derived from one response, plus the one to select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextPlan {
    /// Contexts sorted by id
    pub contexts: Vec<KubeContext>,
    /// Lexicographically smallest context id
    pub default_context: String,
}

/// Derive connection contexts from a signing response.
///
/// The namespace defaults to the one carried by the role. Every context must
/// name at least one cluster.
///
/// # Errors
///
/// Returns [`Error::Protocol`] when a context has no clusters, no context is
/// present at all, or a cluster URL cannot be parsed.
pub fn plan_contexts(result: &CertificateResponse, namespace: Option<&str>) -> Result<ContextPlan> {
    let namespace = namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or(&result.namespace);
    let credentials = format!("{}/{}", result.role, result.username);

    let mut contexts = Vec::new();
    for ctx in &result.contexts {
        if ctx.clusters.is_empty() {
            return Err(Error::Protocol(format!(
                "no clusters provided for Customer: {:?}, Environment: {:?}, Role: {:?}",
                result.customer, result.environment, result.role
            )));
        }
        for (name, server) in &ctx.clusters {
            contexts.push(KubeContext {
                id: format!("{}/{name}/{}", result.role, result.username),
                cluster_name: name.clone(),
                cluster: host_from_url(server)?,
                server: server.clone(),
                credentials: credentials.clone(),
                namespace: namespace.to_string(),
            });
        }
    }

    contexts.sort_by(|a, b| a.id.cmp(&b.id));
    let default_context = contexts
        .first()
        .map(|c| c.id.clone())
        .ok_or_else(|| Error::Protocol(format!("no contexts returned for role {:?}", result.role)))?;

    Ok(ContextPlan {
        contexts,
        default_context,
    })
}

/// `host[:port]` of an API server URL.
fn host_from_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw).map_err(|e| Error::Protocol(format!("cluster address {raw:?}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Protocol(format!("cluster address {raw:?} has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Where [`write_bundle`] put the credential files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    /// Issued certificate
    pub cert: PathBuf,
    /// Private key
    pub key: PathBuf,
    /// Cluster CA certificate
    pub ca: PathBuf,
}

/// Write certificate, key, and CA under `dir/certs/{role}/`.
///
/// Directories are created `0700` and files `0600` on Unix.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the response lacks a file or names a role
/// or user that cannot be a single path component, and [`Error::Io`] on
/// filesystem failures.
pub fn write_bundle(dir: &Path, result: &CertificateResponse) -> Result<BundlePaths> {
    Role::parse(&result.role)
        .map_err(|e| Error::Protocol(format!("response carries an invalid role: {e}")))?;
    if !is_path_component(&result.username) {
        return Err(Error::Protocol(format!(
            "response carries an unusable username {:?}",
            result.username
        )));
    }

    let certs_dir = dir.join("certs").join(&result.role);
    let file = |name: &str| {
        result
            .files
            .get(name)
            .ok_or_else(|| Error::Protocol(format!("response is missing {name}")))
    };

    let cert_name = cert_file(&result.username);
    let key_name = key_file(&result.username);
    let paths = BundlePaths {
        cert: certs_dir.join(&cert_name),
        key: certs_dir.join(&key_name),
        ca: certs_dir.join(CA_FILE),
    };

    write_private(&paths.cert, file(&cert_name)?)?;
    write_private(&paths.key, file(&key_name)?)?;
    write_private(&paths.ca, file(CA_FILE)?)?;
    Ok(paths)
}

fn is_path_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_private_dir(parent)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    Ok(())
}

fn create_private_dir(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)?;
    Ok(())
}
