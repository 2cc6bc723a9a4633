//! TLS for the keyserver listener.
//!
//! The listening certificate is issued by the `servertls` authority at
//! startup and re-issued before it expires. Client certificates are
//! optional at the handshake; when one is presented it must chain to the
//! authentication authority.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use x509_parser::prelude::{FromDer, X509Certificate};

use keysystem_auth::{PolicyContext, PolicyHandle};

use crate::error::ServerError;

/// Delay before retrying a failed re-issue.
const REISSUE_RETRY: std::time::Duration = std::time::Duration::from_secs(60);

pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

#[derive(Debug)]
struct Issued {
    key: Arc<CertifiedKey>,
    not_after: DateTime<Utc>,
    renew_at: DateTime<Utc>,
}

/// The keyserver's own certificate, swappable while the listener runs.
#[derive(Debug)]
pub struct ServerIdentity {
    names: Vec<String>,
    lifespan: Duration,
    current: RwLock<Issued>,
}

impl ServerIdentity {
    pub fn issue(
        ctx: &PolicyContext,
        names: Vec<String>,
        lifespan: Duration,
    ) -> Result<Self, ServerError> {
        let issued = Self::fresh(ctx, &names, lifespan)?;
        info!(names = ?names, not_after = %issued.not_after, "issued server certificate");
        Ok(Self {
            names,
            lifespan,
            current: RwLock::new(issued),
        })
    }

    /// Issue a new certificate from `ctx` and start serving it.
    pub fn reissue(&self, ctx: &PolicyContext) -> Result<(), ServerError> {
        let issued = Self::fresh(ctx, &self.names, self.lifespan)?;
        info!(not_after = %issued.not_after, "re-issued server certificate");
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = issued;
        Ok(())
    }

    pub fn renew_at(&self) -> DateTime<Utc> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .renew_at
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .not_after
    }

    fn fresh(ctx: &PolicyContext, names: &[String], lifespan: Duration) -> Result<Issued, ServerError> {
        let now = Utc::now();
        let (cert_pem, key_pem) = ctx.issue_server_identity(names, lifespan, now)?;
        Ok(Issued {
            key: Arc::new(certified_key(&cert_pem, &key_pem)?),
            not_after: now + lifespan,
            renew_at: now + lifespan / 2,
        })
    }
}

impl ResolvesServerCert for ServerIdentity {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(
            &self.current.read().unwrap_or_else(PoisonError::into_inner).key,
        ))
    }
}

/// Build a `CertifiedKey` from PEM text.
pub fn certified_key(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey, ServerError> {
    let certs = parse_certificates(cert_pem)?;
    let key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
        .map_err(|e| ServerError::tls(format!("failed to parse private key: {e}")))?;
    let signing = provider()
        .key_provider
        .load_private_key(key)
        .map_err(|e| ServerError::tls(format!("unsupported private key: {e}")))?;
    Ok(CertifiedKey::new(certs, signing))
}

fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::tls(format!("failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(ServerError::tls("no certificates found"));
    }
    Ok(certs)
}

/// Rustls server configuration: our rotating identity plus optional client
/// certificates verified against the authentication authority.
pub fn server_config(
    ctx: &PolicyContext,
    identity: Arc<ServerIdentity>,
) -> Result<ServerConfig, ServerError> {
    let provider = provider();

    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(ctx.authentication_authority().public_material())? {
        roots
            .add(cert)
            .map_err(|e| ServerError::tls(format!("failed to add client CA: {e}")))?;
    }

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .allow_unauthenticated()
        .build()
        .map_err(|e| ServerError::tls(format!("client verifier error: {e}")))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::tls(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(identity);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Subject common name of a DER certificate.
pub fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}

/// Re-issue the server certificate at half of its lifespan until shutdown.
pub async fn rotate_server_identity(
    identity: Arc<ServerIdentity>,
    policy: Arc<PolicyHandle>,
    shutdown: CancellationToken,
) {
    let mut wait = until(identity.renew_at());
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        wait = match identity.reissue(&policy.snapshot()) {
            Ok(()) => until(identity.renew_at()),
            Err(err) => {
                error!(error = %err, not_after = %identity.not_after(), "cannot re-issue server certificate");
                REISSUE_RETRY
            }
        };
    }
}

fn until(at: DateTime<Utc>) -> std::time::Duration {
    (at - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keysystem_auth::test_utils::PolicyFixture;

    #[test]
    fn issues_identity_and_builds_config() {
        let fixture = PolicyFixture::new();
        let ctx = fixture.context();
        let identity = Arc::new(
            ServerIdentity::issue(&ctx, vec!["localhost".into()], Duration::hours(2)).unwrap(),
        );
        let before = identity.renew_at();
        assert!(before > Utc::now() + Duration::minutes(59));

        identity.reissue(&ctx).unwrap();
        assert!(identity.renew_at() >= before);
        assert!(server_config(&ctx, identity).is_ok());
    }

    #[test]
    fn reads_common_name() {
        let fixture = PolicyFixture::new();
        let ctx = fixture.context();
        let (pem, _) = ctx
            .issue_server_identity(&["keyserver.mit.edu".into()], Duration::hours(1), Utc::now())
            .unwrap();
        let der = parse_certificates(&pem).unwrap();
        assert_eq!(common_name(der[0].as_ref()).as_deref(), Some("keyserver.mit.edu"));
        assert_eq!(common_name(b"garbage"), None);
    }
}
