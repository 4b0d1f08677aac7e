//! Request handlers for role listing and certificate signing.
//!
//! Signing runs in stages and stops at the first failure:
//!
//! 1. credentials present (see [`super::auth`])
//! 2. body decodes as a PEM certificate request
//! 3. request common name equals the authenticated user
//! 4. the request's Organization parses as a role
//! 5. the directory confirms the user holds the role
//! 6. step-up approval, when configured
//! 7. the role's environment is configured
//! 8. the primary context signs the request
//!
//! With step-up enabled the entry endpoint stops after stage 5 and answers
//! `399` pointing at the step-up endpoint, whose middleware repeats 2–5 and
//! runs 6 before the handler continues with 7.

use std::sync::Arc;

use axum::{
    Extension, Json,
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, info};

use super::AppState;
use super::audit::{self, AuditEvent};
use super::auth::BasicCredentials;
use crate::pki::{self, CertificateRequest};
use crate::protocol::{
    CA_FILE, CertificateResponse, Context, FileMap, RolesResponse, STEP_UP_PATH, STEP_UP_STATUS,
    cert_file,
};
use crate::role::{Role, RoleParseError};
use crate::{Error, Result};

/// Largest certificate request body accepted.
pub(crate) const MAX_CSR_BYTES: usize = 64 * 1024;

/// A request that passed stages 2–5.
#[derive(Debug, Clone)]
pub struct AuthorizedRequest {
    /// Authenticated username
    pub user: String,
    /// Role name as carried by the request
    pub role_name: String,
    /// Parsed role
    pub role: Role,
    /// Decoded certificate request
    pub request: CertificateRequest,
}

/// GET /api/v1/roles
pub async fn roles(
    State(state): State<Arc<AppState>>,
    Extension(creds): Extension<BasicCredentials>,
) -> Result<Json<RolesResponse>> {
    let roles = state
        .directory
        .fetch_roles_for_user(&creds.username, &creds.password)
        .await
        .map_err(Error::from)?;

    audit::emit(&AuditEvent::roles_listed(&creds.username, roles.len()));
    Ok(Json(RolesResponse {
        user: creds.username,
        roles,
    }))
}

/// POST /api/v1/signcsr
pub async fn sign_csr(
    State(state): State<Arc<AppState>>,
    Extension(creds): Extension<BasicCredentials>,
    body: Bytes,
) -> Result<Response> {
    let authorized = authorize(&state, &creds, &body).await?;

    if state.step_up.is_some() {
        audit::emit(&AuditEvent::step_up(&authorized.user, &authorized.role_name));
        return Ok(step_up_redirect());
    }

    issue(&state, &authorized).map(IntoResponse::into_response)
}

/// POST /api/v1/signcsr/stepup
///
/// Only reachable through [`step_up_middleware`], which supplies the
/// [`AuthorizedRequest`].
pub async fn sign_csr_after_step_up(
    State(state): State<Arc<AppState>>,
    Extension(authorized): Extension<AuthorizedRequest>,
) -> Result<Json<CertificateResponse>> {
    issue(&state, &authorized)
}

/// Repeat authorization, then require step-up approval before the wrapped
/// handler runs.
pub async fn step_up_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(creds) = request.extensions().get::<BasicCredentials>().cloned() else {
        return Error::Authentication("Authentication required".to_string()).into_response();
    };
    let Some(authenticator) = state.step_up.clone() else {
        return Error::Internal("step-up endpoint without authenticator".to_string())
            .into_response();
    };

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_CSR_BYTES).await {
        Ok(body) => body,
        Err(e) => return Error::Parse(format!("cannot read request body: {e}")).into_response(),
    };

    let authorized = match authorize(&state, &creds, &body).await {
        Ok(authorized) => authorized,
        Err(e) => return e.into_response(),
    };

    info!(user = %creds.username, role = %authorized.role_name, "Awaiting step-up approval");
    if let Err(e) = authenticator.authenticate(&creds.username).await {
        let err = Error::from(e);
        audit::emit(&AuditEvent::denied(
            &creds.username,
            Some(&authorized.role_name),
            err.status_code().as_u16(),
            err.to_string(),
        ));
        return err.into_response();
    }

    let mut request = Request::from_parts(parts, Body::from(body));
    request.extensions_mut().insert(authorized);
    next.run(request).await
}

/// Stages 2–5, with the outcome audited on failure.
async fn authorize(state: &AppState, creds: &BasicCredentials, body: &[u8]) -> Result<AuthorizedRequest> {
    let mut role_name = None;
    let result = check_request(state, creds, body, &mut role_name).await;

    if let Err(ref e) = result {
        audit::emit(&AuditEvent::denied(
            &creds.username,
            role_name.as_deref(),
            e.status_code().as_u16(),
            e.to_string(),
        ));
    }
    result
}

async fn check_request(
    state: &AppState,
    creds: &BasicCredentials,
    body: &[u8],
    role_name: &mut Option<String>,
) -> Result<AuthorizedRequest> {
    let request = CertificateRequest::from_pem(body).map_err(|e| Error::Parse(e.to_string()))?;

    // Checked before any directory traffic.
    if request.common_name() != creds.username {
        return Err(Error::IdentityMismatch {
            subject: request.common_name().to_string(),
            user: creds.username.clone(),
        });
    }

    let name = request
        .role()
        .filter(|r| !r.is_empty())
        .ok_or(RoleParseError::Missing)?
        .to_string();
    *role_name = Some(name.clone());
    let role = Role::parse(&name)?;

    state
        .directory
        .validate_role_for_user(&creds.username, &creds.password, &name)
        .await?;

    debug!(user = %creds.username, role = %name, "Role validated");
    Ok(AuthorizedRequest {
        user: creds.username.clone(),
        role_name: name,
        role,
        request,
    })
}

/// Stages 7–8.
fn issue(state: &AppState, authorized: &AuthorizedRequest) -> Result<Json<CertificateResponse>> {
    let user = &authorized.user;
    let role = &authorized.role;

    let Some(environment) = state.environments.find(&role.customer, &role.environment) else {
        let err = Error::EnvironmentNotFound {
            role: authorized.role_name.clone(),
        };
        audit::emit(&AuditEvent::denied(
            user,
            Some(&authorized.role_name),
            err.status_code().as_u16(),
            err.to_string(),
        ));
        return Err(err);
    };

    let primary = environment.primary();
    let cert_pem = pki::sign_csr(&authorized.request, primary.signer())?.into_bytes();

    let mut addresses: Vec<String> = primary.clusters().values().cloned().collect();
    addresses.sort();

    let files_for = |cluster_ca: &[u8]| {
        FileMap::from([
            (CA_FILE.to_string(), cluster_ca.to_vec()),
            (cert_file(user), cert_pem.clone()),
        ])
    };

    let contexts = environment
        .contexts()
        .iter()
        .map(|ctx| Context {
            files: files_for(ctx.cluster_ca_pem()),
            clusters: ctx.clusters().clone(),
        })
        .collect();

    audit::emit(&AuditEvent::granted(
        user,
        &authorized.role_name,
        &environment.customer,
        &environment.environment,
    ));
    info!(user = %user, role = %authorized.role_name, "Authorised to assume role");

    Ok(Json(CertificateResponse {
        username: user.clone(),
        role: authorized.role_name.clone(),
        files: files_for(primary.cluster_ca_pem()),
        addresses,
        customer: environment.customer.clone(),
        environment: environment.environment.clone(),
        namespace: role.namespace.clone(),
        contexts,
    }))
}

fn step_up_redirect() -> Response {
    let status = StatusCode::from_u16(STEP_UP_STATUS).unwrap_or(StatusCode::TEMPORARY_REDIRECT);
    let mut response = (status, "step-up authentication required").into_response();
    response
        .headers_mut()
        .insert(header::LOCATION, HeaderValue::from_static(STEP_UP_PATH));
    response
}

/// GET /healthcheck
pub async fn health() -> &'static str {
    "OK"
}

/// GET /version
pub async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
