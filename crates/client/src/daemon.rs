//! The keyclient daemon: bootstrap, then keep every credential fresh.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use keysystem_infra::{PUBLIC_MODE, read_optional, remove_if_exists, write_atomic};

use crate::config::ClientConfig;
use crate::download::DownloadTask;
use crate::error::ClientError;
use crate::keys;
use crate::renewal::RenewalTask;
use crate::retry::{Retry, sleep_unless_cancelled};
use crate::state::{ClientState, StateHandle};
use crate::transport::{Auth, HttpKeyserver, Keyserver};
use crate::validity::Validity;

/// A spawned task, keyed by its tokio id so panics can still be attributed.
struct TaskInfo {
    label: String,
    keygrant: bool,
}

#[derive(Default)]
struct Tasks {
    set: JoinSet<Result<(), ClientError>>,
    info: HashMap<task::Id, TaskInfo>,
}

impl Tasks {
    fn spawn<F>(&mut self, label: String, keygrant: bool, task: F)
    where
        F: Future<Output = Result<(), ClientError>> + Send + 'static,
    {
        let id = self.set.spawn(task).id();
        self.info.insert(id, TaskInfo { label, keygrant });
    }

    /// The next task to finish. A panic surfaces as [`ClientError::Panicked`].
    async fn next(&mut self) -> Option<(TaskInfo, Result<(), ClientError>)> {
        let (id, result) = match self.set.join_next_with_id().await? {
            Ok((id, result)) => (id, Some(result)),
            Err(join) if join.is_panic() => (join.id(), None),
            Err(join) => (join.id(), Some(Err(ClientError::Cancelled))),
        };
        let info = self.info.remove(&id).unwrap_or(TaskInfo {
            label: format!("task {id}"),
            keygrant: false,
        });
        let result = result.unwrap_or_else(|| {
            Err(ClientError::Panicked {
                task: info.label.clone(),
            })
        });
        Some((info, result))
    }
}

pub struct Keyclient {
    config: ClientConfig,
    server: Arc<dyn Keyserver>,
    state: StateHandle,
}

impl Keyclient {
    pub fn new(config: ClientConfig, server: Arc<dyn Keyserver>) -> Self {
        Self {
            config,
            server,
            state: StateHandle::new(),
        }
    }

    /// A client talking HTTPS to the configured keyserver.
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let authority = read_optional(&config.authority)?.ok_or_else(|| {
            ClientError::config(format!(
                "keyserver authority {} does not exist",
                config.authority.display()
            ))
        })?;
        let server = HttpKeyserver::new(
            &config.server,
            &authority,
            config.request_timeout.to_std(),
        )?;
        Ok(Self::new(config, Arc::new(server)))
    }

    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    /// Reach `KeygrantObtained`, exchanging the bootstrap token if needed.
    pub async fn bootstrap(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        match self.try_bootstrap(cancel).await {
            Ok(()) => Ok(()),
            Err(ClientError::Cancelled) => Err(ClientError::Cancelled),
            Err(err) => {
                self.state.fail(err.to_string());
                Err(err)
            }
        }
    }

    async fn try_bootstrap(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let keygrant = &self.config.keygrant;

        if let Some(text) = read_optional(&keygrant.cert)? {
            match Validity::from_tls_pem(&text) {
                Ok(validity) if !validity.is_expired(Utc::now()) => {
                    info!(not_after = %validity.not_after, "using existing keygranting certificate");
                    return self.state.transition(ClientState::KeygrantObtained);
                }
                Ok(validity) => {
                    warn!(not_after = %validity.not_after, "keygranting certificate expired")
                }
                Err(err) => warn!(error = %err, "ignoring unreadable keygranting certificate"),
            }
        }

        let token = read_optional(&keygrant.token)?
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ClientError::config(format!(
                    "no valid keygranting certificate and no bootstrap token at {}",
                    keygrant.token.display()
                ))
            })?;
        let auth = &Auth::Token(token);

        self.state.transition(ClientState::TokenAuthenticating)?;
        let server = self.server.as_ref();
        let principal = self.retrying(cancel, move || server.whoami(auth)).await?;
        info!(%principal, "bootstrap token accepted");

        self.state.transition(ClientState::KeyGenerating)?;
        let csr = {
            let key = keys::load_or_generate_tls(&keygrant.key)?;
            keys::tls_request(&key, &[])?
        };
        let (api, csr) = (keygrant.api.as_str(), csr.as_str());
        let cert = self
            .retrying(cancel, move || server.invoke(auth, api, csr))
            .await?;
        let validity = Validity::from_tls_pem(&cert)?;
        write_atomic(&keygrant.cert, cert.as_bytes(), PUBLIC_MODE)?;
        remove_if_exists(&keygrant.token)?;
        info!(%principal, not_after = %validity.not_after, "obtained keygranting certificate");

        self.state.transition(ClientState::KeygrantObtained)
    }

    async fn retrying<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut retry = Retry::new(&self.config.retry);
        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                attempt = op() => attempt,
            };
            match attempt {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let wait: Duration = retry.failure(err, false)?;
                    warn!(failures = retry.failures(), retry_in = ?wait, "keyserver unavailable; retrying");
                    if !sleep_unless_cancelled(wait, cancel).await {
                        return Err(ClientError::Cancelled);
                    }
                }
            }
        }
    }

    /// Bootstrap, then run every renewal and download task until `cancel`
    /// fires or the keygranting certificate is lost.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ClientError> {
        match self.bootstrap(&cancel).await {
            Err(ClientError::Cancelled) => return Ok(()),
            other => other?,
        }

        let config = &self.config;
        let mut tasks = Tasks::default();

        let keygrant = RenewalTask::keygrant(
            &config.keygrant,
            Arc::clone(&self.server),
            config.renew_fraction,
            config.retry,
        );
        tasks.spawn(keygrant.api().to_string(), true, keygrant.run(cancel.clone()));

        for credential in &config.credentials {
            let task = RenewalTask::credential(
                credential,
                &config.keygrant,
                Arc::clone(&self.server),
                config.renew_fraction,
                config.retry,
            );
            tasks.spawn(task.api().to_string(), false, task.run(cancel.clone()));
        }

        for download in &config.downloads {
            let task = DownloadTask::new(
                download,
                &config.keygrant,
                Arc::clone(&self.server),
                config.retry,
            );
            tasks.spawn(task.name().to_string(), false, task.run(cancel.clone()));
        }

        self.state.transition(ClientState::SteadyRenewal)?;

        let mut fatal = None;
        while let Some((task, result)) = tasks.next().await {
            match result {
                Ok(()) | Err(ClientError::Cancelled) => {}
                Err(err) if task.keygrant => {
                    error!(task = %task.label, error = %err, "lost the keygranting certificate");
                    self.state.fail(err.to_string());
                    cancel.cancel();
                    fatal.get_or_insert(err);
                }
                Err(err) => error!(task = %task.label, error = %err, "task stopped"),
            }
        }

        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
