//! Audit logging for issuance decisions.
//!
//! Every event is emitted via `tracing::info!` with the event serialized as
//! JSON in the `audit` field.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `issuance.granted` | A certificate was signed and returned |
//! | `issuance.step_up` | The caller was redirected to the step-up endpoint |
//! | `issuance.denied` | Any step of the issuance flow rejected the request |
//! | `roles.listed` | Role enumeration succeeded |

use serde::Serialize;

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"issuance.granted"`).
    pub event: &'static str,
    /// Authenticated username.
    pub user: String,
    /// Requested role, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Customer the certificate was issued for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
    /// Environment the certificate was issued for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// HTTP status returned for denials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Reason for denial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    /// Construct an `issuance.granted` event.
    #[must_use]
    pub fn granted(user: &str, role: &str, customer: &str, environment: &str) -> Self {
        Self {
            event: "issuance.granted",
            user: user.to_string(),
            role: Some(role.to_string()),
            customer: Some(customer.to_string()),
            environment: Some(environment.to_string()),
            status: None,
            reason: None,
        }
    }

    /// Construct an `issuance.step_up` event.
    #[must_use]
    pub fn step_up(user: &str, role: &str) -> Self {
        Self {
            event: "issuance.step_up",
            user: user.to_string(),
            role: Some(role.to_string()),
            customer: None,
            environment: None,
            status: None,
            reason: None,
        }
    }

    /// Construct an `issuance.denied` event.
    #[must_use]
    pub fn denied(user: &str, role: Option<&str>, status: u16, reason: impl Into<String>) -> Self {
        Self {
            event: "issuance.denied",
            user: user.to_string(),
            role: role.map(str::to_string),
            customer: None,
            environment: None,
            status: Some(status),
            reason: Some(reason.into()),
        }
    }

    /// Construct a `roles.listed` event.
    #[must_use]
    pub fn roles_listed(user: &str, count: usize) -> Self {
        Self {
            event: "roles.listed",
            user: user.to_string(),
            role: None,
            customer: None,
            environment: None,
            status: None,
            reason: Some(format!("{count} roles")),
        }
    }
}

/// Emit an audit event.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "kubetoken audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
