//! Listener loop and background tasks.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use chrono::Utc;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use keysystem_auth::PolicyHandle;
use keysystem_infra::load_context;

use crate::context::PeerInfo;
use crate::error::ServerError;
use crate::tls::{self, ServerIdentity};

/// Accept TLS connections and serve `app` on each until `shutdown` fires.
///
/// Every request carries a [`PeerInfo`] with the remote address and the
/// verified client certificate's common name, if any.
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    loop {
        let (tcp, remote_addr) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            serve_connection(tcp, remote_addr, acceptor, app).await;
        });
    }
}

async fn serve_connection(
    tcp: tokio::net::TcpStream,
    remote_addr: SocketAddr,
    acceptor: TlsAcceptor,
    app: Router,
) {
    let stream = match acceptor.accept(tcp).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(peer = %remote_addr, error = %e, "TLS handshake failed");
            return;
        }
    };

    let client_principal = stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(|leaf| tls::common_name(leaf.as_ref()));
    let peer = PeerInfo {
        remote_addr: Some(remote_addr),
        client_principal,
    };

    let service = hyper::service::service_fn(move |mut req: hyper::Request<Incoming>| {
        req.extensions_mut().insert(peer.clone());
        let app = app.clone();
        async move { Ok::<_, Infallible>(app.oneshot(req).await.unwrap_or_else(|e| match e {})) }
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(peer = %remote_addr, error = %e, "connection closed with error");
    }
}

/// Drop expired bootstrap tokens every `every` until shutdown.
pub async fn sweep_tokens(
    policy: Arc<PolicyHandle>,
    every: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let removed = policy.snapshot().tokens().sweep_expired(Utc::now());
        if removed > 0 {
            debug!(removed, "swept expired bootstrap tokens");
        }
    }
}

/// Rebuild the policy from `config` and publish it, keeping the token
/// registry. The running policy stays in place when the new one fails.
pub fn reload(
    config: &Path,
    policy: &PolicyHandle,
    identity: Option<&ServerIdentity>,
) -> Result<(), ServerError> {
    let tokens = Arc::clone(policy.snapshot().tokens());
    let next = load_context(config, Some(tokens))?;
    policy.replace(next);
    if let Some(identity) = identity {
        identity.reissue(&policy.snapshot())?;
    }
    info!(path = %config.display(), "policy reloaded");
    Ok(())
}

/// Reload on every SIGHUP until shutdown.
#[cfg(unix)]
pub async fn reload_on_sighup(
    config: PathBuf,
    policy: Arc<PolicyHandle>,
    identity: Option<Arc<ServerIdentity>>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            received = hangup.recv() => if received.is_none() { return Ok(()) },
        }

        let config = config.clone();
        let policy = Arc::clone(&policy);
        let identity = identity.clone();
        let outcome =
            tokio::task::spawn_blocking(move || reload(&config, &policy, identity.as_deref()))
                .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "reload failed; keeping the current policy"),
            Err(join) => error!(error = %join, "reload task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use keysystem_auth::PolicyContext;
    use keysystem_auth::test_utils::PolicyFixture;

    fn write_policy(dir: &Path, fixture: &PolicyFixture) -> PathBuf {
        let authorities = dir.join("authorities");
        std::fs::create_dir_all(&authorities).unwrap();
        let mut config = fixture.config.clone();
        config.authoritydir = authorities.clone();
        for (name, authority) in &config.authorities {
            let material = fixture.authority(name);
            std::fs::write(authorities.join(&authority.key), &material.key_pem).unwrap();
            std::fs::write(authorities.join(&authority.cert), &material.cert_pem).unwrap();
        }
        let path = dir.join("keyserver.yaml");
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
        path
    }

    #[test]
    fn reload_swaps_policy_and_keeps_tokens() {
        let fixture = PolicyFixture::new();
        let dir = tempfile::tempdir().unwrap();
        let path = write_policy(dir.path(), &fixture);

        let handle = PolicyHandle::new(fixture.context());
        let token = handle
            .snapshot()
            .issue_token("bare.mit.edu", Duration::hours(1))
            .unwrap();
        let before = handle.snapshot();

        reload(&path, &handle, None).unwrap();
        let after = handle.snapshot();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.authenticate_token(&token).is_ok());
    }

    #[test]
    fn failed_reload_keeps_the_running_policy() {
        let fixture = PolicyFixture::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyserver.yaml");
        std::fs::write(&path, "nope-this-is-wrong: nah").unwrap();

        let handle = PolicyHandle::new(fixture.context());
        let before = handle.snapshot();
        assert!(reload(&path, &handle, None).is_err());
        assert!(Arc::ptr_eq(&before, &handle.snapshot()));
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let fixture = PolicyFixture::new();
        let handle = Arc::new(PolicyHandle::new(fixture.context()));
        let ctx: Arc<PolicyContext> = handle.snapshot();
        let past = Utc::now() - Duration::hours(2);
        ctx.tokens()
            .grant_token_at("bare.mit.edu".parse().unwrap(), Duration::hours(1), past);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(sweep_tokens(
            Arc::clone(&handle),
            std::time::Duration::from_millis(10),
            shutdown.clone(),
        ));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.cancel();
        task.await.unwrap();
        assert!(ctx.tokens().is_empty());
    }
}
