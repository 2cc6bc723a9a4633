//! Policy error model.

use thiserror::Error;

/// Result type used across the policy engine.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Policy-level error.
///
/// Messages are surfaced to remote callers, so they must never carry key
/// material or metadata belonging to an account other than the caller's.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// The configuration is malformed or structurally invalid (duplicate
    /// names, unresolved references, cycles). Fatal at load time.
    #[error("configuration error: {0}")]
    Config(String),

    /// The caller is not entitled to the requested grant or name.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Unknown or expired token, unknown grant, authority or file.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request itself is unacceptable (e.g. names outside the whitelist).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A template placeholder could not be resolved for an account.
    #[error("template error: {0}")]
    Template(String),

    /// The underlying signing library failed.
    #[error("signing error: {0}")]
    Signing(String),
}

impl PolicyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    pub fn signing(msg: impl Into<String>) -> Self {
        Self::Signing(msg.into())
    }

    /// Short machine-readable code, used in HTTP error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            PolicyError::Config(_) => "config_error",
            PolicyError::Unauthorized(_) => "unauthorized",
            PolicyError::NotFound(_) => "not_found",
            PolicyError::BadRequest(_) => "bad_request",
            PolicyError::Template(_) => "template_error",
            PolicyError::Signing(_) => "signing_error",
        }
    }
}
