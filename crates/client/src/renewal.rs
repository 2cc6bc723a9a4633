//! One renewal task per certificate the client keeps fresh.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keysystem_infra::{PUBLIC_MODE, read_optional, write_atomic};

use crate::config::{CredentialConfig, CredentialKind, KeygrantConfig, RetryConfig};
use crate::error::ClientError;
use crate::keys;
use crate::retry::{Retry, sleep_unless_cancelled};
use crate::transport::{Auth, Keyserver};
use crate::validity::Validity;

/// Shortest pause between two renewals of the same certificate.
const MIN_WAIT: StdDuration = StdDuration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NotDue { next: DateTime<Utc> },
    Renewed { next: DateTime<Utc> },
}

impl Outcome {
    pub fn next(&self) -> DateTime<Utc> {
        match self {
            Outcome::NotDue { next } | Outcome::Renewed { next } => *next,
        }
    }
}

pub struct RenewalTask {
    api: String,
    kind: CredentialKind,
    key: PathBuf,
    cert: PathBuf,
    names: Vec<String>,
    keygrant: KeygrantConfig,
    server: Arc<dyn Keyserver>,
    fraction: f64,
    retry: RetryConfig,
}

impl RenewalTask {
    /// Renews the keygranting certificate with itself.
    pub fn keygrant(
        keygrant: &KeygrantConfig,
        server: Arc<dyn Keyserver>,
        fraction: f64,
        retry: RetryConfig,
    ) -> Self {
        Self {
            api: keygrant.api.clone(),
            kind: CredentialKind::Tls,
            key: keygrant.key.clone(),
            cert: keygrant.cert.clone(),
            names: Vec::new(),
            keygrant: keygrant.clone(),
            server,
            fraction,
            retry,
        }
    }

    pub fn credential(
        credential: &CredentialConfig,
        keygrant: &KeygrantConfig,
        server: Arc<dyn Keyserver>,
        fraction: f64,
        retry: RetryConfig,
    ) -> Self {
        Self {
            api: credential.api.clone(),
            kind: credential.kind,
            key: credential.key.clone(),
            cert: credential.cert.clone(),
            names: credential.names.clone(),
            keygrant: keygrant.clone(),
            server,
            fraction,
            retry,
        }
    }

    pub fn api(&self) -> &str {
        &self.api
    }

    /// Validity of the certificate on disk, if there is a readable one.
    pub fn current(&self) -> Result<Option<Validity>, ClientError> {
        match read_optional(&self.cert)? {
            Some(text) => match Validity::parse(self.kind, &text) {
                Ok(validity) => Ok(Some(validity)),
                Err(err) => {
                    warn!(path = %self.cert.display(), error = %err, "ignoring unreadable certificate");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Renew if the certificate is missing or past its renewal point.
    pub async fn renew_if_due(&self, now: DateTime<Utc>) -> Result<Outcome, ClientError> {
        if let Some(validity) = self.current()? {
            let at = validity.renew_at(self.fraction);
            if now < at {
                debug!(api = %self.api, renew_at = %at, "certificate still fresh");
                return Ok(Outcome::NotDue { next: at });
            }
        }

        let request = match self.kind {
            CredentialKind::Tls => {
                let key = keys::load_or_generate_tls(&self.key)?;
                keys::tls_request(&key, &self.names)?
            }
            CredentialKind::Ssh => keys::load_or_generate_ssh(&self.key)?,
        };
        let auth = Auth::from_keygrant(&self.keygrant)?;
        let issued = self.server.invoke(&auth, &self.api, &request).await?;

        let validity = Validity::parse(self.kind, &issued)?;
        write_atomic(&self.cert, ensure_newline(issued).as_bytes(), PUBLIC_MODE)?;
        info!(
            api = %self.api,
            path = %self.cert.display(),
            not_after = %validity.not_after,
            "certificate renewed"
        );
        Ok(Outcome::Renewed {
            next: validity.renew_at(self.fraction),
        })
    }

    /// Keep the certificate fresh until cancelled or a fatal error.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ClientError> {
        let mut retry = Retry::new(&self.retry);
        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                attempt = self.renew_if_due(Utc::now()) => attempt,
            };

            let wait = match attempt {
                Ok(outcome) => {
                    retry.success();
                    until(outcome.next()).max(MIN_WAIT)
                }
                Err(err) => {
                    let expired = self
                        .current()
                        .ok()
                        .flatten()
                        .is_some_and(|v| v.is_expired(Utc::now()));
                    let wait = retry.failure(err, expired)?;
                    warn!(
                        api = %self.api,
                        failures = retry.failures(),
                        retry_in = ?wait,
                        "renewal failed; retrying"
                    );
                    wait
                }
            };

            if !sleep_unless_cancelled(wait, &cancel).await {
                return Ok(());
            }
        }
    }
}

fn ensure_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

pub(crate) fn until(at: DateTime<Utc>) -> StdDuration {
    (at - Utc::now()).to_std().unwrap_or(StdDuration::ZERO)
}
