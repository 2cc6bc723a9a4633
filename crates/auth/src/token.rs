//! Bootstrap bearer tokens.
//!
//! A token authenticates a brand-new node just long enough to obtain its
//! first keygranting certificate. Tokens stay valid until they expire or are
//! revoked; expiry is checked on lookup and expired entries are removed by
//! [`TokenRegistry::sweep_expired`].

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;

use keysystem_core::{PolicyError, PolicyResult, Principal};

const TOKEN_BYTES: usize = 32;

/// A token as stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    pub subject: Principal,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BootstrapToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Thread-safe token store shared by all in-flight requests.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    tokens: RwLock<HashMap<String, BootstrapToken>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_token(&self, subject: Principal, ttl: Duration) -> String {
        self.grant_token_at(subject, ttl, Utc::now())
    }

    pub fn grant_token_at(&self, subject: Principal, ttl: Duration, now: DateTime<Utc>) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        let entry = BootstrapToken {
            subject,
            issued_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone(), entry);
        token
    }

    pub fn lookup_token(&self, token: &str) -> PolicyResult<BootstrapToken> {
        self.lookup_token_at(token, Utc::now())
    }

    /// Resolve a token to its subject. Unknown and expired tokens are
    /// indistinguishable to the caller.
    pub fn lookup_token_at(&self, token: &str, now: DateTime<Utc>) -> PolicyResult<BootstrapToken> {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        match tokens.get(token) {
            Some(entry) if !entry.is_expired(now) => Ok(entry.clone()),
            _ => Err(PolicyError::not_found("unknown or expired token")),
        }
    }

    /// Returns whether the token existed.
    pub fn revoke(&self, token: &str) -> bool {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some()
    }

    /// Drop every expired token; returns how many were removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        let before = tokens.len();
        tokens.retain(|_, entry| !entry.is_expired(now));
        before - tokens.len()
    }

    pub fn len(&self) -> usize {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
