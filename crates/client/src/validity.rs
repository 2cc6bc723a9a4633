//! Validity windows of issued certificates and the renewal point within them.

use chrono::{DateTime, Duration, TimeZone, Utc};
use x509_parser::pem::parse_x509_pem;

use crate::config::CredentialKind;
use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Validity {
    pub fn parse(kind: CredentialKind, text: &str) -> Result<Self, ClientError> {
        match kind {
            CredentialKind::Tls => Self::from_tls_pem(text),
            CredentialKind::Ssh => Self::from_ssh_cert(text),
        }
    }

    pub fn from_tls_pem(pem: &str) -> Result<Self, ClientError> {
        let (_, pem) = parse_x509_pem(pem.as_bytes())
            .map_err(|e| ClientError::key(format!("invalid certificate PEM: {e}")))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| ClientError::key(format!("invalid certificate: {e}")))?;
        let validity = cert.validity();
        Ok(Self {
            not_before: from_unix(validity.not_before.timestamp())?,
            not_after: from_unix(validity.not_after.timestamp())?,
        })
    }

    pub fn from_ssh_cert(text: &str) -> Result<Self, ClientError> {
        let cert = ssh_key::Certificate::from_openssh(text.trim())
            .map_err(|e| ClientError::key(format!("invalid SSH certificate: {e}")))?;
        Ok(Self {
            not_before: from_unix(seconds(cert.valid_after())?)?,
            not_after: from_unix(seconds(cert.valid_before())?)?,
        })
    }

    pub fn lifespan(&self) -> Duration {
        self.not_after - self.not_before
    }

    /// The moment remaining validity drops to `fraction` of the lifespan.
    pub fn renew_at(&self, fraction: f64) -> DateTime<Utc> {
        let lifespan_ms = self.lifespan().num_milliseconds() as f64;
        self.not_after - Duration::milliseconds((lifespan_ms * fraction) as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }
}

fn seconds(value: u64) -> Result<i64, ClientError> {
    i64::try_from(value).map_err(|_| ClientError::key("certificate validity out of range"))
}

fn from_unix(seconds: i64) -> Result<DateTime<Utc>, ClientError> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| ClientError::key("certificate validity out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keysystem_auth::test_utils::{PolicyFixture, tls_csr};
    use keysystem_auth::AuthMethod;

    #[test]
    fn renewal_point_is_a_fraction_before_expiry() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let validity = Validity {
            not_before: now,
            not_after: now + Duration::hours(24),
        };
        assert_eq!(validity.renew_at(0.5), now + Duration::hours(12));
        assert_eq!(validity.renew_at(0.25), now + Duration::hours(18));
        assert!(!validity.is_expired(now + Duration::hours(23)));
        assert!(validity.is_expired(now + Duration::hours(24)));
    }

    #[test]
    fn reads_issued_tls_certificate() {
        let fixture = PolicyFixture::new();
        let ctx = fixture.context();
        let account = ctx.account("bare.mit.edu").unwrap();
        let (csr, _) = tls_csr(&[]);
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let pem = ctx
            .invoke_at(account, AuthMethod::ClientCertificate, "renew-keygrant", &csr, now)
            .unwrap();

        let validity = Validity::from_tls_pem(&pem).unwrap();
        assert_eq!(validity.not_before, now);
        assert_eq!(validity.lifespan(), Duration::hours(24));
    }

    #[test]
    fn reads_issued_ssh_certificate() {
        let fixture = PolicyFixture::new();
        let ctx = fixture.context();
        let account = ctx.account("ruby-01.mit.edu").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let public = crate::keys::load_or_generate_ssh(&dir.path().join("host_key")).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let cert = ctx
            .invoke_at(account, AuthMethod::ClientCertificate, "grant-ssh", &public, now)
            .unwrap();

        let validity = Validity::parse(CredentialKind::Ssh, &cert).unwrap();
        assert_eq!(validity.not_after, now + Duration::hours(24));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Validity::from_tls_pem("nope").is_err());
        assert!(Validity::from_ssh_cert("ssh-ed25519 nope").is_err());
    }
}
