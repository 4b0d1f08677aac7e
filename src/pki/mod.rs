//! Certificate authority.
//!
//! # Modules
//!
//! - [`authority`]: CA creation, leaf issuance, CSR generation and signing
//! - [`signer`]: loading CA material from PEM, decoding incoming CSRs
//!
//! All keys are RSA 2048 and all signatures RSA PKCS#1 v1.5 with SHA-256.
//! Validity windows start one day in the past to absorb clock skew between
//! the issuer and the clusters.

pub mod authority;
pub mod signer;

use thiserror::Error;

pub use authority::{
    GeneratedCert, GeneratedCsr, LEAF_LIFETIME, expiry_in_days, new_ca, new_csr, new_leaf,
    sign_csr,
};
pub use signer::{CertificateRequest, Signer};

/// Errors raised by certificate generation and signing.
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key pair could not be generated or parsed
    #[error("key error: {0}")]
    Key(String),

    /// PEM input could not be decoded
    #[error("PEM error: {0}")]
    Pem(String),

    /// Certificate could not be parsed
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The supplied issuer is not a certificate authority
    #[error("CA certificate is not a valid CA")]
    NotCa,

    /// Certificate construction or signing failed
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
}
