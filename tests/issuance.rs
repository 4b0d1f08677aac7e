//! End-to-end signing tests against the router
//!
//! Covers the staged checks of `POST /api/v1/signcsr` without step-up:
//! credentials, PEM decoding, identity, role naming, directory membership and
//! environment lookup.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use pretty_assertions::assert_eq;
use tower::ServiceExt;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;

use common::{PASSWORD, ROLE, StaticDirectory, acme_dev, app_state, basic, test_ca};
use kubetoken::environment::{Environment, Environments, SigningContext};
use kubetoken::pki::{self, GeneratedCert};
use kubetoken::protocol::{CertificateResponse, RolesResponse, ROLES_PATH, SIGN_CSR_PATH};
use kubetoken::server::create_router;

fn router(directory: &Arc<StaticDirectory>, environments: Environments) -> Router {
    create_router(app_state(Arc::clone(directory), None, environments))
}

async fn post_csr(router: Router, auth: Option<String>, body: impl Into<Body>) -> Response {
    let mut request = Request::post(SIGN_CSR_PATH).header(header::CONTENT_TYPE, "application/x-pem-file");
    if let Some(auth) = auth {
        request = request.header(header::AUTHORIZATION, auth);
    }
    router.oneshot(request.body(body.into()).unwrap()).await.unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

fn csr(user: &str, role: &str) -> String {
    pki::new_csr(user, role).unwrap().csr_pem
}

fn ca_der(ca: &GeneratedCert) -> Vec<u8> {
    let (_, pem) = parse_x509_pem(ca.cert_pem.as_bytes()).unwrap();
    pem.contents
}

/// A member of the role gets a certificate for exactly the requested subject
#[tokio::test]
async fn test_member_receives_certificate() {
    let ca = test_ca();
    let directory = StaticDirectory::with_members(&["alice"]);
    let response = post_csr(
        router(&directory, acme_dev(&ca)),
        Some(basic("alice", PASSWORD)),
        csr("alice", ROLE),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let result: CertificateResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(result.username, "alice");
    assert_eq!(result.role, ROLE);
    assert_eq!(result.customer, "acme");
    assert_eq!(result.environment, "dev");
    assert_eq!(result.namespace, "default");
    assert_eq!(
        result.addresses,
        vec![
            "https://a.dev.acme.example.com:6443".to_string(),
            "https://b.dev.acme.example.com:6443".to_string(),
        ]
    );
    assert_eq!(result.contexts.len(), 1);
    assert_eq!(result.contexts[0].clusters.len(), 2);
    assert_eq!(result.files["ca.pem"], ca.cert_pem.as_bytes());

    let (_, cert_pem) = parse_x509_pem(&result.files["alice.pem"]).unwrap();
    let cert = cert_pem.parse_x509().unwrap();
    let subject = cert.subject();
    assert_eq!(
        subject.iter_common_name().next().unwrap().as_str().unwrap(),
        "alice"
    );
    assert_eq!(
        subject.iter_organization().next().unwrap().as_str().unwrap(),
        ROLE
    );

    let ca_bytes = ca_der(&ca);
    let (_, ca_cert) = X509Certificate::from_der(&ca_bytes).unwrap();
    cert.verify_signature(Some(ca_cert.public_key())).unwrap();

    let lifetime = cert.validity().not_after.timestamp() - cert.validity().not_before.timestamp();
    assert_eq!(lifetime, 30 * 60 * 60);
}

/// The request subject must be the authenticated user; the directory is never asked
#[tokio::test]
async fn test_identity_mismatch_is_forbidden_without_directory_traffic() {
    let ca = test_ca();
    let directory = StaticDirectory::with_members(&["alice", "bob"]);
    let response = post_csr(
        router(&directory, acme_dev(&ca)),
        Some(basic("bob", PASSWORD)),
        csr("alice", ROLE),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("does not match auth username"), "{body}");
    assert_eq!(directory.bind_count(), 0);
}

/// Missing credentials get a Basic challenge
#[tokio::test]
async fn test_missing_credentials_are_challenged() {
    let ca = test_ca();
    let directory = StaticDirectory::with_members(&["alice"]);
    let response = post_csr(router(&directory, acme_dev(&ca)), None, csr("alice", ROLE)).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    assert_eq!(directory.bind_count(), 0);
}

/// A body that is not a PEM certificate request is a bad request
#[tokio::test]
async fn test_garbage_body_is_bad_request() {
    let ca = test_ca();
    let directory = StaticDirectory::with_members(&["alice"]);
    let response = post_csr(
        router(&directory, acme_dev(&ca)),
        Some(basic("alice", PASSWORD)),
        "not a certificate request",
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(directory.bind_count(), 0);
}

/// A role outside the naming convention is not found
#[tokio::test]
async fn test_unparsable_role_is_not_found() {
    let ca = test_ca();
    let directory = StaticDirectory::with_members(&["alice"]);
    let response = post_csr(
        router(&directory, acme_dev(&ca)),
        Some(basic("alice", PASSWORD)),
        csr("alice", "cluster-admins"),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// A well-formed role for an unconfigured environment is a bad request
#[tokio::test]
async fn test_unknown_environment_is_bad_request() {
    let ca = test_ca();
    let directory = StaticDirectory::with_members(&["alice"]);
    let response = post_csr(
        router(&directory, acme_dev(&ca)),
        Some(basic("alice", PASSWORD)),
        csr("alice", "kube-acme-default-prod-dl-admin"),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("no known environment"), "{body}");
}

/// Not being a member of the role group is forbidden
#[tokio::test]
async fn test_non_member_is_forbidden() {
    let ca = test_ca();
    let directory = StaticDirectory::with_members(&[]);
    let response = post_csr(
        router(&directory, acme_dev(&ca)),
        Some(basic("alice", PASSWORD)),
        csr("alice", ROLE),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(directory.bind_count(), 1);
}

/// A wrong password fails the directory bind and reveals nothing about it
#[tokio::test]
async fn test_wrong_password_is_forbidden() {
    let ca = test_ca();
    let directory = StaticDirectory::with_members(&["alice"]);
    let response = post_csr(
        router(&directory, acme_dev(&ca)),
        Some(basic("alice", "wrong")),
        csr("alice", ROLE),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert_eq!(body, "directory authorization failed");
}

/// Roles come back as the directory reports them
#[tokio::test]
async fn test_roles_listing() {
    let ca = test_ca();
    let directory = StaticDirectory::with_members(&[ROLE, "kube-acme-web-dev-dl-viewer"]);
    let response = router(&directory, acme_dev(&ca))
        .oneshot(
            Request::get(ROLES_PATH)
                .header(header::AUTHORIZATION, basic("alice", PASSWORD))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let roles: RolesResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(roles.user, "alice");
    assert_eq!(roles.roles, vec![ROLE.to_string(), "kube-acme-web-dev-dl-viewer".to_string()]);
}

/// A request naming a second organization is refused before the directory is asked
#[tokio::test]
async fn test_extra_organization_is_bad_request() {
    let mut params = rcgen::CertificateParams::default();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.distinguished_name.push(rcgen::DnType::CommonName, "alice");
    params.distinguished_name.push(rcgen::DnType::OrganizationName, ROLE);
    params
        .distinguished_name
        .push(rcgen::DnType::CustomDnType(vec![2, 5, 4, 10]), "system:masters");
    let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256).unwrap();
    let request = params.serialize_request(&key).unwrap().pem().unwrap();

    let ca = test_ca();
    let directory = StaticDirectory::with_members(&["alice"]);
    let response = post_csr(
        router(&directory, acme_dev(&ca)),
        Some(basic("alice", PASSWORD)),
        request,
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("repeats attribute"), "{body}");
    assert_eq!(directory.bind_count(), 0);
}

/// Oversized bodies are refused before any directory traffic
#[tokio::test]
async fn test_oversized_body_is_refused() {
    let ca = test_ca();
    let directory = StaticDirectory::with_members(&["alice"]);
    let response = post_csr(
        router(&directory, acme_dev(&ca)),
        Some(basic("alice", PASSWORD)),
        "A".repeat(64 * 1024 + 1),
    )
    .await;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(directory.bind_count(), 0);
}

/// Every context carries its own cluster CA next to the one shared certificate
#[tokio::test]
async fn test_contexts_carry_their_own_cluster_ca() {
    let signing_ca = test_ca();
    let other_signing_ca = test_ca();
    let cluster_ca = test_ca();
    let other_cluster_ca = test_ca();

    let primary = SigningContext::from_pem(
        signing_ca.cert_pem.as_bytes(),
        signing_ca.key_pem.as_bytes(),
        Some(cluster_ca.cert_pem.as_bytes()),
        BTreeMap::from([
            ("b".to_string(), "https://b.dev.acme.example.com:6443".to_string()),
            ("a".to_string(), "https://a.dev.acme.example.com:6443".to_string()),
        ]),
    )
    .unwrap();
    let secondary = SigningContext::from_pem(
        other_signing_ca.cert_pem.as_bytes(),
        other_signing_ca.key_pem.as_bytes(),
        Some(other_cluster_ca.cert_pem.as_bytes()),
        BTreeMap::from([("c".to_string(), "https://c.dev.acme.example.com:6443".to_string())]),
    )
    .unwrap();
    let environments = Environments::new(vec![
        Environment::new("acme", "dev", vec![primary, secondary]).unwrap(),
    ]);

    let directory = StaticDirectory::with_members(&["alice"]);
    let response = post_csr(
        router(&directory, environments),
        Some(basic("alice", PASSWORD)),
        csr("alice", ROLE),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let result: CertificateResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();

    assert_eq!(result.files["ca.pem"], cluster_ca.cert_pem.as_bytes());
    assert_eq!(
        result.addresses,
        vec![
            "https://a.dev.acme.example.com:6443".to_string(),
            "https://b.dev.acme.example.com:6443".to_string(),
        ]
    );

    assert_eq!(result.contexts.len(), 2);
    assert_eq!(result.contexts[0].files["ca.pem"], cluster_ca.cert_pem.as_bytes());
    assert_eq!(result.contexts[1].files["ca.pem"], other_cluster_ca.cert_pem.as_bytes());
    assert_eq!(result.contexts[1].clusters.len(), 1);
    for context in &result.contexts {
        assert_eq!(context.files["alice.pem"], result.files["alice.pem"]);
    }

    let (_, cert_pem) = parse_x509_pem(&result.files["alice.pem"]).unwrap();
    let cert = cert_pem.parse_x509().unwrap();
    let ca_bytes = ca_der(&signing_ca);
    let (_, ca_cert) = X509Certificate::from_der(&ca_bytes).unwrap();
    cert.verify_signature(Some(ca_cert.public_key())).unwrap();
}
