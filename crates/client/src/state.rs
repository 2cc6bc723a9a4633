//! The keyclient lifecycle.
//!
//! ```text
//! Unbootstrapped ─┬─> TokenAuthenticating ─> KeyGenerating ─┐
//!                 └──────────────────────────────────────────┴─> KeygrantObtained ─> SteadyRenewal
//! ```
//!
//! `Failed` is reachable from every state and absorbing.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Unbootstrapped,
    TokenAuthenticating,
    KeyGenerating,
    KeygrantObtained,
    SteadyRenewal,
    Failed(String),
}

impl ClientState {
    pub fn can_transition_to(&self, next: &ClientState) -> bool {
        use ClientState::*;
        match (self, next) {
            (Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Unbootstrapped, TokenAuthenticating | KeygrantObtained) => true,
            (TokenAuthenticating, KeyGenerating) => true,
            (KeyGenerating, KeygrantObtained) => true,
            (KeygrantObtained, SteadyRenewal) => true,
            _ => false,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ClientState::Failed(_))
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Unbootstrapped => f.write_str("unbootstrapped"),
            ClientState::TokenAuthenticating => f.write_str("token-authenticating"),
            ClientState::KeyGenerating => f.write_str("key-generating"),
            ClientState::KeygrantObtained => f.write_str("keygrant-obtained"),
            ClientState::SteadyRenewal => f.write_str("steady-renewal"),
            ClientState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Shared, observable client state. Transitions are validated.
#[derive(Debug, Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<ClientState>>,
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ClientState::Unbootstrapped);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> ClientState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.tx.subscribe()
    }

    pub fn transition(&self, next: ClientState) -> Result<(), ClientError> {
        let mut refused = None;
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                tracing::info!(from = %current, to = %next, "client state changed");
                *current = next.clone();
                true
            } else {
                refused = Some(current.clone());
                false
            }
        });
        match refused {
            None => Ok(()),
            Some(from) => Err(ClientError::State { from, to: next }),
        }
    }

    /// Move to `Failed`; a no-op when already failed.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_failed() {
                return false;
            }
            tracing::error!(from = %current, reason = %reason, "client failed");
            *current = ClientState::Failed(reason.clone());
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_path_is_legal() {
        let state = StateHandle::new();
        for next in [
            ClientState::TokenAuthenticating,
            ClientState::KeyGenerating,
            ClientState::KeygrantObtained,
            ClientState::SteadyRenewal,
        ] {
            state.transition(next).unwrap();
        }
        assert_eq!(state.current(), ClientState::SteadyRenewal);
    }

    #[test]
    fn existing_keygrant_skips_the_token_exchange() {
        let state = StateHandle::new();
        state.transition(ClientState::KeygrantObtained).unwrap();
        assert!(matches!(
            state.transition(ClientState::KeyGenerating),
            Err(ClientError::State { .. })
        ));
    }

    #[test]
    fn failed_is_absorbing() {
        let state = StateHandle::new();
        state.fail("token rejected");
        state.fail("second reason is ignored");
        assert_eq!(state.current(), ClientState::Failed("token rejected".into()));
        assert!(state.transition(ClientState::SteadyRenewal).is_err());
    }

    #[test]
    fn no_skipping_steps() {
        let state = StateHandle::new();
        assert!(state.transition(ClientState::SteadyRenewal).is_err());
        assert_eq!(state.current(), ClientState::Unbootstrapped);
    }
}
