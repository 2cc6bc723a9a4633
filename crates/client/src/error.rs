use thiserror::Error;

use keysystem_infra::InfraError;

use crate::state::ClientState;

/// Client-side error taxonomy.
///
/// Only [`ClientError::Transient`] is retried; everything else stops the
/// task that hit it.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection failure, timeout or 5xx response.
    #[error("keyserver unavailable: {0}")]
    Transient(String),

    /// The keyserver refused the request (4xx).
    #[error("keyserver rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The TLS handshake failed over a certificate: the keyserver refused
    /// ours, or we refused its.
    #[error("certificate rejected during the TLS handshake: {0}")]
    Handshake(String),

    /// A transient streak outlived the retry policy or the certificate.
    #[error("giving up after {failures} consecutive failures: {last}")]
    Exhausted { failures: u32, last: String },

    #[error(transparent)]
    Io(#[from] InfraError),

    #[error("key material: {0}")]
    Key(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("illegal state transition {from} -> {to}")]
    State { from: ClientState, to: ClientState },

    #[error("task {task} panicked")]
    Panicked { task: String },

    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn key(msg: impl Into<String>) -> Self {
        Self::Key(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient(_))
    }
}
