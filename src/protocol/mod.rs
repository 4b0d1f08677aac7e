//! Wire types shared by the issuing server and its clients

mod types;

pub use types::*;

/// Role enumeration endpoint
pub const ROLES_PATH: &str = "/api/v1/roles";

/// Certificate signing endpoint
pub const SIGN_CSR_PATH: &str = "/api/v1/signcsr";

/// Certificate signing endpoint reached after a step-up redirect
pub const STEP_UP_PATH: &str = "/api/v1/signcsr/stepup";

/// Status code the server answers with when the request must be repeated
/// against the step-up endpoint named in `Location`.
pub const STEP_UP_STATUS: u16 = 399;

/// Name of the cluster CA certificate in a file map
pub const CA_FILE: &str = "ca.pem";

/// Name of the issued certificate for `user` in a file map
#[must_use]
pub fn cert_file(user: &str) -> String {
    format!("{user}.pem")
}

/// Name of the private key for `user` in a file map
#[must_use]
pub fn key_file(user: &str) -> String {
    format!("{user}-key.pem")
}
