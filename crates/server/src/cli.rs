use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use keysystem_core::parse_lifespan;

/// Cluster credential authority.
#[derive(Debug, Clone, Parser)]
#[command(name = "keyserver", version, about)]
pub struct Args {
    /// Policy file.
    #[arg(long, short, default_value = "/etc/keysystem/keyserver.yaml")]
    pub config: PathBuf,

    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:20557")]
    pub listen: SocketAddr,

    /// DNS name or IP address for the server certificate; repeat for more.
    #[arg(long = "server-name", required_unless_present = "plaintext")]
    pub server_names: Vec<String>,

    /// Lifespan of the server certificate; it is re-issued at half-life.
    #[arg(long, default_value = "30d", value_parser = lifespan)]
    pub server_cert_lifespan: chrono::Duration,

    /// How often expired bootstrap tokens are dropped.
    #[arg(long, default_value = "5m", value_parser = std_lifespan)]
    pub token_sweep_interval: std::time::Duration,

    /// Serve plain HTTP (tokens only, no client certificates). For local
    /// testing.
    #[arg(long)]
    pub plaintext: bool,
}

fn lifespan(text: &str) -> Result<chrono::Duration, String> {
    parse_lifespan(text).map_err(|e| e.to_string())
}

fn std_lifespan(text: &str) -> Result<std::time::Duration, String> {
    lifespan(text)?.to_std().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_needs_a_server_name() {
        assert!(Args::try_parse_from(["keyserver"]).is_err());
        let args = Args::try_parse_from(["keyserver", "--plaintext"]).unwrap();
        assert!(args.server_names.is_empty());
    }

    #[test]
    fn parses_lifespans() {
        let args = Args::try_parse_from([
            "keyserver",
            "--server-name",
            "keyserver.mit.edu",
            "--server-name",
            "18.181.0.2",
            "--server-cert-lifespan",
            "7d",
            "--token-sweep-interval",
            "30s",
        ])
        .unwrap();
        assert_eq!(args.server_names.len(), 2);
        assert_eq!(args.server_cert_lifespan, chrono::Duration::days(7));
        assert_eq!(args.token_sweep_interval, std::time::Duration::from_secs(30));
        assert!(
            Args::try_parse_from(["keyserver", "--plaintext", "--server-cert-lifespan", "soon"])
                .is_err()
        );
    }
}
