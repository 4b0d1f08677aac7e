//! kubetoken
//!
//! Issues short-lived X.509 client certificates for Kubernetes clusters. A
//! certificate is signed only when the requesting user is a (possibly nested)
//! member of the directory group named by the role and, optionally, approves
//! a step-up push on their phone.
//!
//! # Features
//!
//! - **Role naming**: `kube-{customer}-{namespace}-{environment}-dl-{role}`
//! - **Directory authorization**: LDAPS bind as the user, transitive membership
//! - **Certificate authority**: RSA/SHA-256, six hour client certificates
//! - **Step-up**: Duo push before signing, signalled to clients with status 399
//! - **Client**: bounded step-up redirect loop, context planning

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod client;
pub mod config;
pub mod directory;
pub mod environment;
pub mod error;
pub mod pki;
pub mod protocol;
pub mod role;
pub mod server;
pub mod step_up;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init tracing: {e}")))?,
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init tracing: {e}")))?,
    }

    Ok(())
}
