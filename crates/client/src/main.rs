use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use keysystem_client::{ClientConfig, Keyclient};

/// Bootstrap and renew this host's credentials from a keyserver.
#[derive(Debug, Parser)]
#[command(name = "keyclient", version)]
struct Args {
    #[arg(long, default_value = "/etc/keysystem/keyclient.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    keysystem_observability::init();
    let args = Args::parse();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = ClientConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let client = Keyclient::connect(config)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received");
            }
            cancel.cancel();
        });
    }

    client.run(cancel).await?;
    tracing::info!(state = %client.state().current(), "keyclient stopped");
    Ok(())
}
