use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use keysystem_auth::PolicyHandle;
use keysystem_server::cli::Args;
use keysystem_server::tls::{self, ServerIdentity};
use keysystem_server::{AppState, build_app, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    keysystem_observability::init();
    let args = Args::parse();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let context = keysystem_infra::load_context(&args.config, None)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let policy = Arc::new(PolicyHandle::new(context));
    let shutdown = CancellationToken::new();

    let identity = if args.plaintext {
        None
    } else {
        let ctx = policy.snapshot();
        Some(Arc::new(
            ServerIdentity::issue(&ctx, args.server_names.clone(), args.server_cert_lifespan)
                .context("issuing the server certificate")?,
        ))
    };

    tokio::spawn(server::sweep_tokens(
        Arc::clone(&policy),
        args.token_sweep_interval,
        shutdown.clone(),
    ));

    #[cfg(unix)]
    {
        let reloader = server::reload_on_sighup(
            args.config.clone(),
            Arc::clone(&policy),
            identity.clone(),
            shutdown.clone(),
        );
        tokio::spawn(async move {
            if let Err(err) = reloader.await {
                tracing::error!(error = %err, "SIGHUP handler stopped");
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received");
            }
            shutdown.cancel();
        });
    }

    let app = build_app(AppState::new(Arc::clone(&policy)));
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    tracing::info!(addr = %listener.local_addr()?, tls = !args.plaintext, "listening");

    match identity {
        None => {
            tracing::warn!("serving plain HTTP; client certificates are unavailable");
            let cancelled = shutdown.clone();
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { cancelled.cancelled().await })
            .await?;
        }
        Some(identity) => {
            tokio::spawn(tls::rotate_server_identity(
                Arc::clone(&identity),
                Arc::clone(&policy),
                shutdown.clone(),
            ));
            let config = tls::server_config(&policy.snapshot(), identity)?;
            let acceptor = TlsAcceptor::from(Arc::new(config));
            server::serve_tls(listener, acceptor, app, shutdown).await?;
        }
    }

    Ok(())
}
