//! Keyclient configuration file.
//!
//! ```yaml
//! server: https://keyserver.mit.edu:20557
//! authority: /etc/keysystem/keyclient/keyserver.pem
//! keygrant:
//!   key: /etc/keysystem/keyclient/granting.key
//!   cert: /etc/keysystem/keyclient/granting.pem
//!   token: /etc/keysystem/keyclient/bootstrap.token
//!   api: renew-keygrant
//! credentials:
//!   - kind: ssh
//!     key: /etc/ssh/ssh_host_ed25519_key
//!     cert: /etc/ssh/ssh_host_ed25519_key-cert.pub
//!     api: grant-ssh
//! downloads:
//!   - kind: static
//!     name: cluster.conf
//!     path: /etc/keysystem/cluster.conf
//!     refresh-period: 1d
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::Deserialize;

use keysystem_core::parse_lifespan;

use crate::error::ClientError;

/// A duration written the way the keyserver writes lifespans (`90s`, `1h30m`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Span(pub Duration);

impl TryFrom<String> for Span {
    type Error = String;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        parse_lifespan(&text).map(Span).map_err(|e| e.to_string())
    }
}

impl Span {
    pub fn to_std(self) -> std::time::Duration {
        self.0.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ClientConfig {
    /// Base URL of the keyserver.
    pub server: String,
    /// CA certificate the keyserver's listening certificate chains to.
    pub authority: PathBuf,
    pub keygrant: KeygrantConfig,
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
    #[serde(default)]
    pub downloads: Vec<DownloadConfig>,
    #[serde(default = "default_renew_fraction")]
    pub renew_fraction: f64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct KeygrantConfig {
    pub key: PathBuf,
    pub cert: PathBuf,
    /// Bootstrap token file; deleted after a successful exchange.
    pub token: PathBuf,
    #[serde(default = "default_keygrant_api")]
    pub api: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialKind {
    Tls,
    Ssh,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CredentialConfig {
    pub kind: CredentialKind,
    pub key: PathBuf,
    pub cert: PathBuf,
    pub api: String,
    /// Names put in the CSR (TLS only). The keyserver decides the final
    /// names; these must be a subset of what the grant allows.
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadKind {
    /// Output of a `static-content` grant.
    Grant,
    /// A file from the keyserver's static directory.
    Static,
    /// An authority's public material.
    Pubkey,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DownloadConfig {
    pub kind: DownloadKind,
    /// Grant API, static file name or authority name.
    pub name: String,
    pub path: PathBuf,
    pub refresh_period: Span,
    #[serde(default = "default_download_mode")]
    pub mode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_retry_initial")]
    pub initial: Span,
    #[serde(default = "default_retry_max")]
    pub max: Span,
    /// Consecutive transient failures tolerated before giving up.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial: default_retry_initial(),
            max: default_retry_max(),
            max_failures: default_max_failures(),
        }
    }
}

fn default_renew_fraction() -> f64 {
    0.5
}

fn default_request_timeout() -> Span {
    Span(Duration::seconds(30))
}

fn default_keygrant_api() -> String {
    "renew-keygrant".to_string()
}

fn default_download_mode() -> u32 {
    0o644
}

fn default_retry_initial() -> Span {
    Span(Duration::seconds(5))
}

fn default_retry_max() -> Span {
    Span(Duration::minutes(10))
}

fn default_max_failures() -> u32 {
    20
}

impl ClientConfig {
    pub fn parse(text: &str) -> Result<Self, ClientError> {
        let config: Self = serde_yaml::from_str(text)
            .map_err(|e| ClientError::config(format!("invalid keyclient config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ClientError::config(format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }

    fn validate(&self) -> Result<(), ClientError> {
        if !(self.renew_fraction > 0.0 && self.renew_fraction < 1.0) {
            return Err(ClientError::config(format!(
                "renew-fraction must be between 0 and 1, got {}",
                self.renew_fraction
            )));
        }
        if self.retry.initial.0 > self.retry.max.0 {
            return Err(ClientError::config("retry.initial exceeds retry.max"));
        }
        if !(self.server.starts_with("https://") || self.server.starts_with("http://")) {
            return Err(ClientError::config(format!(
                "server must be an http(s) URL, got '{}'",
                self.server
            )));
        }
        for credential in &self.credentials {
            if credential.kind == CredentialKind::Ssh && !credential.names.is_empty() {
                return Err(ClientError::config(format!(
                    "ssh credential '{}' cannot request names",
                    credential.api
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server: https://keyserver.mit.edu:20557
authority: /etc/keysystem/keyclient/keyserver.pem
keygrant:
  key: /etc/keysystem/keyclient/granting.key
  cert: /etc/keysystem/keyclient/granting.pem
  token: /etc/keysystem/keyclient/bootstrap.token
credentials:
  - kind: ssh
    key: /etc/ssh/ssh_host_ed25519_key
    cert: /etc/ssh/ssh_host_ed25519_key-cert.pub
    api: grant-ssh
  - kind: tls
    key: /etc/keysystem/node.key
    cert: /etc/keysystem/node.pem
    api: grant-tls
    names: [ruby-01.mit.edu]
downloads:
  - kind: static
    name: cluster.conf
    path: /etc/keysystem/cluster.conf
    refresh-period: 1d
retry:
  max-failures: 3
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = ClientConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.keygrant.api, "renew-keygrant");
        assert_eq!(config.credentials.len(), 2);
        assert_eq!(config.credentials[1].kind, CredentialKind::Tls);
        assert_eq!(config.downloads[0].refresh_period, Span(Duration::days(1)));
        assert_eq!(config.downloads[0].mode, 0o644);
        assert_eq!(config.renew_fraction, 0.5);
        assert_eq!(config.retry.max_failures, 3);
        assert_eq!(config.retry.initial, Span(Duration::seconds(5)));
        assert_eq!(config.request_timeout, Span(Duration::seconds(30)));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(ClientConfig::parse(&format!("{SAMPLE}renew-fraction: 1.5\n")).is_err());
        assert!(ClientConfig::parse(&format!("{SAMPLE}request-timeout: soon\n")).is_err());
        assert!(ClientConfig::parse(&format!("{SAMPLE}colour: blue\n")).is_err());
        assert!(
            ClientConfig::parse(&SAMPLE.replace("https://keyserver", "ftp://keyserver")).is_err()
        );
    }
}
