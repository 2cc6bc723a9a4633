use thiserror::Error;

use keysystem_core::PolicyError;
use keysystem_infra::InfraError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Infra(#[from] InfraError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn tls(msg: impl std::fmt::Display) -> Self {
        Self::Tls(msg.to_string())
    }
}
