//! Signing material and incoming certificate requests.
//!
//! # File format
//!
//! CA certificates and keys are expected in **PEM format**. Keys may be
//! PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`); both are what
//! openssl and cfssl produce by default.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use rcgen::{CertificateSigningRequestParams, Issuer, KeyPair, PKCS_RSA_SHA256};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateSigningRequestDer, PrivateKeyDer};
use x509_parser::prelude::*;

use super::PkiError;
use super::authority::{single_certificate, spki_modulus_hash};

const CSR_PEM_LABEL: &str = "CERTIFICATE REQUEST";

/// A CA certificate and private key ready to sign requests.
pub struct Signer {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_pem: String,
    subject_key_id: Vec<u8>,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("subject_key_id", &hex::encode(&self.subject_key_id))
            .finish_non_exhaustive()
    }
}

impl Signer {
    /// Build a signer from PEM-encoded CA certificate and RSA private key.
    ///
    /// # Errors
    ///
    /// Returns an error unless `cert_pem` holds exactly one certificate with
    /// an RSA public key and `key_pem` holds an RSA private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, PkiError> {
        let ca_der = single_certificate(cert_pem)?;
        let (_, cert) = X509Certificate::from_der(ca_der.as_ref())
            .map_err(|e| PkiError::Certificate(e.to_string()))?;
        let subject_key_id = spki_modulus_hash(cert.public_key())?;

        let key = load_private_key(key_pem)?;
        let issuer = Issuer::from_ca_cert_der(&ca_der, key)?;

        Ok(Self {
            issuer,
            ca_cert_pem: String::from_utf8_lossy(cert_pem).into_owned(),
            subject_key_id,
        })
    }

    /// Load a signer from a certificate file and a key file.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be read or parsed.
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self, PkiError> {
        let cert = read_file(cert_path)?;
        let key = read_file(key_path)?;
        Self::from_pem(&cert, &key)
    }

    /// PEM of the CA certificate, as loaded.
    #[must_use]
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// SHA-1 of the CA modulus.
    #[must_use]
    pub fn subject_key_id(&self) -> &[u8] {
        &self.subject_key_id
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }
}

/// A decoded PEM certificate signing request.
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    der: Vec<u8>,
    common_name: String,
    organizations: Vec<String>,
}

impl CertificateRequest {
    /// Decode the first PEM block of `pem` as a certificate request.
    ///
    /// # Errors
    ///
    /// Fails when there is no PEM block, the block is not a
    /// `CERTIFICATE REQUEST`, the DER is malformed, the request's
    /// self-signature does not verify, or the subject repeats an attribute
    /// type (two CNs, two Os, ...).
    ///
    /// Only the first CN and O are authorized, so a subject carrying more
    /// than one of either cannot be signed faithfully.
    pub fn from_pem(pem: &[u8]) -> Result<Self, PkiError> {
        let (_, block) = x509_parser::pem::parse_x509_pem(pem)
            .map_err(|_| PkiError::Pem("unable to decode PEM block".to_string()))?;
        if block.label != CSR_PEM_LABEL {
            return Err(PkiError::Pem(format!(
                "expected {CSR_PEM_LABEL:?} block, got {:?}",
                block.label
            )));
        }

        let (_, csr) = X509CertificationRequest::from_der(&block.contents)
            .map_err(|e| PkiError::Certificate(format!("invalid certificate request: {e}")))?;
        csr.verify_signature()
            .map_err(|e| PkiError::Certificate(format!("certificate request signature: {e}")))?;

        let subject = &csr.certification_request_info.subject;
        let mut seen = HashSet::new();
        for attr in subject.iter_attributes() {
            let oid = attr.attr_type().to_id_string();
            if !seen.insert(oid.clone()) {
                return Err(PkiError::Certificate(format!(
                    "certificate request subject repeats attribute {oid}"
                )));
            }
        }

        let common_name = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let organizations = subject
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(str::to_string)
            .collect();

        Ok(Self {
            der: block.contents,
            common_name,
            organizations,
        })
    }

    /// Subject common name (empty when absent).
    #[must_use]
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Subject organizations, in order.
    #[must_use]
    pub fn organizations(&self) -> &[String] {
        &self.organizations
    }

    /// The requested role: the first subject organization.
    #[must_use]
    pub fn role(&self) -> Option<&str> {
        self.organizations.first().map(String::as_str)
    }

    pub(crate) fn to_params(&self) -> Result<CertificateSigningRequestParams, PkiError> {
        let der = CertificateSigningRequestDer::from(self.der.as_slice());
        Ok(CertificateSigningRequestParams::from_der(&der)?)
    }
}

/// Parse an RSA private key (PKCS#1 or PKCS#8) from PEM.
pub(crate) fn load_private_key(pem: &[u8]) -> Result<KeyPair, PkiError> {
    let der = PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| PkiError::Key(format!("cannot decode private key: {e}")))?;
    KeyPair::from_der_and_sign_algo(&der, &PKCS_RSA_SHA256)
        .map_err(|e| PkiError::Key(format!("private key is not a usable RSA key: {e}")))
}

fn read_file(path: &Path) -> Result<Vec<u8>, PkiError> {
    fs::read(path).map_err(|e| PkiError::Pem(format!("cannot read '{}': {e}", path.display())))
}
