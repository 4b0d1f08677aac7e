//! CA creation, leaf issuance, and CSR signing.

use std::fs;
use std::path::Path;

use ::time::{Duration, OffsetDateTime};
use num_bigint_dig::BigUint;
use rand::Rng;
use rcgen::string::PrintableString;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose,
    PKCS_RSA_SHA256, PublicKeyData, SerialNumber,
};
use rustls::pki_types::CertificateDer;
use sha1::{Digest, Sha1};
use tracing::debug;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use super::PkiError;
use super::signer::{CertificateRequest, Signer, load_private_key};

/// Lifetime of certificates issued by [`sign_csr`].
pub const LEAF_LIFETIME: Duration = Duration::hours(6);

/// Backdating applied to every `notBefore`.
const BACKDATE: Duration = Duration::days(1);

/// `serialNumber` attribute type (X.520).
const OID_SERIAL_NUMBER: [u64; 4] = [2, 5, 4, 5];

/// Generated certificate and key pair in PEM format.
#[derive(Debug, Clone)]
pub struct GeneratedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key (PKCS#8).
    pub key_pem: String,
}

impl GeneratedCert {
    /// Write `<stem>.pem` and `<stem>-key.pem` under `dir`.
    pub fn write_to_dir(&self, dir: &Path, stem: &str) -> Result<(), std::io::Error> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(format!("{stem}.pem")), &self.cert_pem)?;
        fs::write(dir.join(format!("{stem}-key.pem")), &self.key_pem)?;
        Ok(())
    }
}

/// Generated certificate request and its private key in PEM format.
#[derive(Debug, Clone)]
pub struct GeneratedCsr {
    /// PEM-encoded `CERTIFICATE REQUEST`.
    pub csr_pem: String,
    /// PEM-encoded private key (PKCS#8). Never leaves the requesting host.
    pub key_pem: String,
}

/// Generate a self-signed CA certificate valid until `expiry`.
pub fn new_ca(cn: &str, expiry: OffsetDateTime) -> Result<GeneratedCert, PkiError> {
    let key = generate_key()?;
    let serial = random_serial();

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    dn.push(
        DnType::CustomDnType(OID_SERIAL_NUMBER.to_vec()),
        DnValue::PrintableString(
            PrintableString::try_from(BigUint::from_bytes_be(&serial).to_str_radix(10))
                .map_err(|e| PkiError::Certificate(e.to_string()))?,
        ),
    );
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from(serial));
    params.not_before = OffsetDateTime::now_utc() - BACKDATE;
    params.not_after = expiry;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.key_identifier_method =
        KeyIdMethod::PreSpecified(modulus_hash(&key.subject_public_key_info())?);

    let cert = params.self_signed(&key)?;
    debug!(cn = %cn, not_after = %expiry, "Generated CA certificate");

    Ok(GeneratedCert {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Issue a leaf certificate for `cn`, signed by the given CA, valid until `expiry`.
///
/// Fails with [`PkiError::NotCa`] unless the CA certificate carries basic
/// constraints with `cA` set.
pub fn new_leaf(
    ca_cert_pem: &str,
    ca_key_pem: &str,
    expiry: OffsetDateTime,
    cn: &str,
    ext_key_usage: &[ExtendedKeyUsagePurpose],
) -> Result<GeneratedCert, PkiError> {
    let ca_der = single_certificate(ca_cert_pem.as_bytes())?;
    ensure_ca(&ca_der)?;

    let ca_key = load_private_key(ca_key_pem.as_bytes())?;
    let issuer = Issuer::from_ca_cert_der(&ca_der, ca_key)?;

    let key = generate_key()?;
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from(random_serial()));
    params.not_before = OffsetDateTime::now_utc() - BACKDATE;
    params.not_after = expiry;
    params.is_ca = IsCa::ExplicitNoCa;
    params.extended_key_usages = ext_key_usage.to_vec();
    params.key_identifier_method =
        KeyIdMethod::PreSpecified(modulus_hash(&key.subject_public_key_info())?);

    let cert = params.signed_by(&key, &issuer)?;
    Ok(GeneratedCert {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Sign a certificate request into a short-lived leaf certificate.
///
/// The request's subject is copied as-is. The certificate is valid from one
/// day ago until [`LEAF_LIFETIME`] from now. Its subject key identifier is the
/// hash of the *signing* CA's modulus, matching certificates issued by
/// earlier releases.
///
/// The issued subject is compared against the request's; any difference in
/// common name or organizations fails the signing.
pub fn sign_csr(request: &CertificateRequest, signer: &Signer) -> Result<String, PkiError> {
    let mut csr = request.to_params()?;
    let now = OffsetDateTime::now_utc();

    csr.params.serial_number = Some(SerialNumber::from(random_serial()));
    csr.params.not_before = now - BACKDATE;
    csr.params.not_after = now + LEAF_LIFETIME;
    csr.params.is_ca = IsCa::ExplicitNoCa;
    csr.params.key_identifier_method = KeyIdMethod::PreSpecified(signer.subject_key_id().to_vec());

    let cert = csr.signed_by(signer.issuer())?;
    ensure_same_subject(request, cert.der())?;
    Ok(cert.pem())
}

/// Issuance expiry `days` from now.
///
/// # Errors
///
/// Returns [`PkiError::Certificate`] unless `days` is positive and the
/// resulting date is representable.
pub fn expiry_in_days(days: i64) -> Result<OffsetDateTime, PkiError> {
    let out_of_range = || PkiError::Certificate(format!("validity of {days} days is out of range"));
    if days <= 0 {
        return Err(out_of_range());
    }
    let seconds = days.checked_mul(86_400).ok_or_else(out_of_range)?;
    OffsetDateTime::now_utc()
        .checked_add(Duration::seconds(seconds))
        .ok_or_else(out_of_range)
}

/// Generate a certificate request for `CN=<user>, O=<role>` and its key.
pub fn new_csr(user: &str, role: &str) -> Result<GeneratedCsr, PkiError> {
    let key = generate_key()?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, user);
    dn.push(DnType::OrganizationName, role);
    params.distinguished_name = dn;

    let csr = params.serialize_request(&key)?;
    Ok(GeneratedCsr {
        csr_pem: csr.pem()?,
        key_pem: key.serialize_pem(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn generate_key() -> Result<KeyPair, PkiError> {
    KeyPair::generate_for(&PKCS_RSA_SHA256).map_err(|e| PkiError::Key(format!("cannot generate key: {e}")))
}

/// 128 random bits, positive as a DER INTEGER.
pub(crate) fn random_serial() -> Vec<u8> {
    let mut bytes: [u8; 16] = rand::rng().random();
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    bytes.to_vec()
}

/// The issued certificate names exactly the subject that was authorized.
fn ensure_same_subject(request: &CertificateRequest, cert_der: &[u8]) -> Result<(), PkiError> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PkiError::Certificate(e.to_string()))?;
    let subject = cert.subject();
    let common_names: Vec<&str> = subject.iter_common_name().filter_map(|a| a.as_str().ok()).collect();
    let organizations: Vec<&str> = subject.iter_organization().filter_map(|a| a.as_str().ok()).collect();

    if common_names != [request.common_name()] || organizations != request.organizations() {
        return Err(PkiError::Certificate(format!(
            "issued subject CN={common_names:?} O={organizations:?} differs from request CN={:?} O={:?}",
            request.common_name(),
            request.organizations()
        )));
    }
    Ok(())
}

/// SHA-1 of an RSA public key's modulus (big-endian, no leading zeros).
pub(crate) fn modulus_hash(spki_der: &[u8]) -> Result<Vec<u8>, PkiError> {
    let (_, spki) = SubjectPublicKeyInfo::from_der(spki_der)
        .map_err(|e| PkiError::Key(format!("cannot parse public key: {e}")))?;
    spki_modulus_hash(&spki)
}

pub(crate) fn spki_modulus_hash(spki: &SubjectPublicKeyInfo<'_>) -> Result<Vec<u8>, PkiError> {
    match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => {
            let start = rsa.modulus.iter().position(|&b| b != 0).unwrap_or(rsa.modulus.len());
            Ok(Sha1::digest(&rsa.modulus[start..]).to_vec())
        }
        Ok(_) => Err(PkiError::Key("public key is not RSA".to_string())),
        Err(e) => Err(PkiError::Key(format!("cannot parse public key: {e}"))),
    }
}

/// Decode PEM holding exactly one certificate.
pub(crate) fn single_certificate(pem: &[u8]) -> Result<CertificateDer<'static>, PkiError> {
    use rustls::pki_types::pem::PemObject;

    let mut certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PkiError::Pem(format!("cannot decode certificate: {e}")))?;

    if certs.len() > 1 {
        return Err(PkiError::Pem(format!(
            "expected one certificate for CA, got {}",
            certs.len()
        )));
    }
    certs
        .pop()
        .ok_or_else(|| PkiError::Pem("no certificate found".to_string()))
}

/// Check that `pem` holds exactly one well-formed X.509 certificate.
pub(crate) fn validate_certificate_pem(pem: &[u8]) -> Result<(), PkiError> {
    let der = single_certificate(pem)?;
    X509Certificate::from_der(der.as_ref()).map_err(|e| PkiError::Certificate(e.to_string()))?;
    Ok(())
}

fn ensure_ca(der: &CertificateDer<'_>) -> Result<(), PkiError> {
    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|e| PkiError::Certificate(e.to_string()))?;
    match cert.basic_constraints() {
        Ok(Some(bc)) if bc.value.ca => Ok(()),
        Ok(_) => Err(PkiError::NotCa),
        Err(e) => Err(PkiError::Certificate(e.to_string())),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use x509_parser::extensions::ParsedExtension;

    fn parse(pem: &str) -> Vec<u8> {
        single_certificate(pem.as_bytes()).unwrap().as_ref().to_vec()
    }

    fn subject_key_id(der: &[u8]) -> Vec<u8> {
        let (_, cert) = X509Certificate::from_der(der).unwrap();
        cert.extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::SubjectKeyIdentifier(id) => Some(id.0.to_vec()),
                _ => None,
            })
            .expect("subject key identifier present")
    }

    fn test_ca() -> GeneratedCert {
        new_ca("kube-ca", OffsetDateTime::now_utc() + Duration::hours(1)).unwrap()
    }

    #[test]
    fn new_ca_is_self_signed_ca() {
        let ca = test_ca();
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem.contains("PRIVATE KEY"));

        let der = parse(&ca.cert_pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        cert.verify_signature(None).unwrap();
        assert!(cert.basic_constraints().unwrap().unwrap().value.ca);

        let usage = cert.key_usage().unwrap().unwrap().value;
        assert!(usage.key_cert_sign());
        assert!(usage.digital_signature());
        assert!(usage.key_encipherment());
    }

    #[test]
    fn new_ca_validity_is_backdated() {
        let expiry = OffsetDateTime::now_utc() + Duration::days(30);
        let ca = new_ca("kube-ca", expiry).unwrap();
        let der = parse(&ca.cert_pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let not_before = cert.validity().not_before.timestamp();
        assert!(now - not_before >= 86_400 - 60);
        assert!((cert.validity().not_after.timestamp() - expiry.unix_timestamp()).abs() <= 1);
    }

    #[test]
    fn new_ca_subject_key_id_is_modulus_hash() {
        let ca = test_ca();
        let der = parse(&ca.cert_pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        assert_eq!(subject_key_id(&der), spki_modulus_hash(cert.public_key()).unwrap());
    }

    #[test]
    fn new_ca_serials_differ() {
        let a = parse(&test_ca().cert_pem);
        let b = parse(&test_ca().cert_pem);
        let (_, a) = X509Certificate::from_der(&a).unwrap();
        let (_, b) = X509Certificate::from_der(&b).unwrap();
        assert_ne!(a.raw_serial(), b.raw_serial());
    }

    #[test]
    fn new_leaf_chains_to_ca() {
        let ca = test_ca();
        let leaf = new_leaf(
            &ca.cert_pem,
            &ca.key_pem,
            OffsetDateTime::now_utc() + Duration::hours(1),
            "dcheney",
            &[ExtendedKeyUsagePurpose::ClientAuth],
        )
        .unwrap();

        let ca_der = parse(&ca.cert_pem);
        let leaf_der = parse(&leaf.cert_pem);
        let (_, ca_cert) = X509Certificate::from_der(&ca_der).unwrap();
        let (_, leaf_cert) = X509Certificate::from_der(&leaf_der).unwrap();

        leaf_cert.verify_signature(Some(ca_cert.public_key())).unwrap();
        assert_eq!(
            leaf_cert.subject().iter_common_name().next().unwrap().as_str().unwrap(),
            "dcheney"
        );
        assert!(leaf_cert.extended_key_usage().unwrap().unwrap().value.client_auth);
    }

    #[test]
    fn new_leaf_rejects_non_ca_issuer() {
        let ca = test_ca();
        let leaf = new_leaf(
            &ca.cert_pem,
            &ca.key_pem,
            OffsetDateTime::now_utc() + Duration::hours(1),
            "not-a-ca",
            &[],
        )
        .unwrap();

        let result = new_leaf(
            &leaf.cert_pem,
            &leaf.key_pem,
            OffsetDateTime::now_utc() + Duration::hours(1),
            "someone",
            &[],
        );
        assert!(matches!(result, Err(PkiError::NotCa)));
    }

    #[test]
    fn new_leaf_rejects_invalid_ca_key() {
        let ca = test_ca();
        let result = new_leaf(
            &ca.cert_pem,
            "not a pem key",
            OffsetDateTime::now_utc() + Duration::hours(1),
            "agent",
            &[],
        );
        assert!(result.is_err());
    }

    #[test]
    fn new_csr_carries_user_and_role() {
        let csr = new_csr("alice", "kube-acme-default-dev-dl-admin").unwrap();
        assert!(csr.csr_pem.contains("BEGIN CERTIFICATE REQUEST"));

        let request = CertificateRequest::from_pem(csr.csr_pem.as_bytes()).unwrap();
        assert_eq!(request.common_name(), "alice");
        assert_eq!(request.role(), Some("kube-acme-default-dev-dl-admin"));
    }

    #[test]
    fn sign_csr_issues_six_hour_leaf() {
        let ca = test_ca();
        let signer = Signer::from_pem(ca.cert_pem.as_bytes(), ca.key_pem.as_bytes()).unwrap();
        let csr = new_csr("alice", "kube-acme-default-dev-dl-admin").unwrap();
        let request = CertificateRequest::from_pem(csr.csr_pem.as_bytes()).unwrap();

        let cert_pem = sign_csr(&request, &signer).unwrap();

        let ca_der = parse(&ca.cert_pem);
        let leaf_der = parse(&cert_pem);
        let (_, ca_cert) = X509Certificate::from_der(&ca_der).unwrap();
        let (_, leaf) = X509Certificate::from_der(&leaf_der).unwrap();

        leaf.verify_signature(Some(ca_cert.public_key())).unwrap();
        assert_eq!(leaf.subject().iter_common_name().next().unwrap().as_str().unwrap(), "alice");
        assert_eq!(
            leaf.subject().iter_organization().next().unwrap().as_str().unwrap(),
            "kube-acme-default-dev-dl-admin"
        );

        let lifetime = leaf.validity().not_after.timestamp() - OffsetDateTime::now_utc().unix_timestamp();
        assert!(lifetime <= 6 * 3600 && lifetime > 6 * 3600 - 120);
        assert!(!leaf.is_ca());
    }

    #[test]
    fn sign_csr_subject_key_id_comes_from_signer() {
        let ca = test_ca();
        let signer = Signer::from_pem(ca.cert_pem.as_bytes(), ca.key_pem.as_bytes()).unwrap();
        let csr = new_csr("alice", "kube-acme-default-dev-dl-admin").unwrap();
        let request = CertificateRequest::from_pem(csr.csr_pem.as_bytes()).unwrap();

        let leaf_der = parse(&sign_csr(&request, &signer).unwrap());
        let ca_der = parse(&ca.cert_pem);

        assert_eq!(subject_key_id(&leaf_der), subject_key_id(&ca_der));
    }

    #[test]
    fn new_ca_subject_carries_decimal_serial() {
        let der = parse(&test_ca().cert_pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let attr = cert
            .subject()
            .iter_attributes()
            .find(|a| a.attr_type().to_id_string() == "2.5.4.5")
            .unwrap();
        assert_eq!(attr.as_str().unwrap(), cert.serial.to_string());
    }

    #[test]
    fn new_leaf_subject_key_id_is_own_modulus_hash() {
        let ca = test_ca();
        let leaf = new_leaf(
            &ca.cert_pem,
            &ca.key_pem,
            OffsetDateTime::now_utc() + Duration::hours(1),
            "kubetoken.example.com",
            &[ExtendedKeyUsagePurpose::ServerAuth],
        )
        .unwrap();

        let leaf_der = parse(&leaf.cert_pem);
        let (_, cert) = X509Certificate::from_der(&leaf_der).unwrap();
        assert_eq!(subject_key_id(&leaf_der), spki_modulus_hash(cert.public_key()).unwrap());
        assert_ne!(subject_key_id(&leaf_der), subject_key_id(&parse(&ca.cert_pem)));
        assert!(!cert.is_ca());
    }

    #[test]
    fn expiry_in_days_rejects_out_of_range() {
        assert!(expiry_in_days(30).unwrap() > OffsetDateTime::now_utc());
        assert!(expiry_in_days(0).is_err());
        assert!(expiry_in_days(-1).is_err());
        assert!(expiry_in_days(i64::MAX).is_err());
        assert!(expiry_in_days(10_000_000).is_err());
    }

    #[test]
    fn random_serial_is_positive_and_wide() {
        let serial = random_serial();
        assert_eq!(serial.len(), 16);
        assert_eq!(serial[0] & 0x80, 0);
        assert_ne!(serial[0], 0);
    }

    #[test]
    fn write_to_dir_creates_cert_and_key_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = test_ca();
        ca.write_to_dir(dir.path(), "ca").unwrap();
        assert!(dir.path().join("ca.pem").exists());
        assert!(dir.path().join("ca-key.pem").exists());
    }
}
