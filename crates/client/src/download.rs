//! Periodic downloads of grant output, static files and authority keys.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keysystem_infra::{read_optional, write_atomic};

use crate::config::{DownloadConfig, DownloadKind, KeygrantConfig, RetryConfig};
use crate::error::ClientError;
use crate::retry::{Retry, sleep_unless_cancelled};
use crate::transport::{Auth, Keyserver};

pub struct DownloadTask {
    config: DownloadConfig,
    keygrant: KeygrantConfig,
    server: Arc<dyn Keyserver>,
    retry: RetryConfig,
}

impl DownloadTask {
    pub fn new(
        config: &DownloadConfig,
        keygrant: &KeygrantConfig,
        server: Arc<dyn Keyserver>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            config: config.clone(),
            keygrant: keygrant.clone(),
            server,
            retry,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Fetch once; returns whether the file on disk changed.
    pub async fn refresh_once(&self) -> Result<bool, ClientError> {
        let name = &self.config.name;
        let contents = match self.config.kind {
            DownloadKind::Grant => {
                let auth = Auth::from_keygrant(&self.keygrant)?;
                self.server.invoke(&auth, name, "").await?
            }
            DownloadKind::Static => self.server.fetch_static(name).await?,
            DownloadKind::Pubkey => self.server.fetch_public(name).await?,
        };

        let path = &self.config.path;
        if read_optional(path)?.as_deref() == Some(contents.as_str()) {
            debug!(name = %name, "download unchanged");
            return Ok(false);
        }
        write_atomic(path, contents.as_bytes(), self.config.mode)?;
        info!(name = %name, path = %path.display(), "download updated");
        Ok(true)
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), ClientError> {
        let mut retry = Retry::new(&self.retry);
        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                attempt = self.refresh_once() => attempt,
            };

            let wait = match attempt {
                Ok(_) => {
                    retry.success();
                    self.config.refresh_period.to_std()
                }
                Err(err) => {
                    let wait = retry.failure(err, false)?;
                    warn!(
                        name = %self.config.name,
                        failures = retry.failures(),
                        retry_in = ?wait,
                        "download failed; retrying"
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
