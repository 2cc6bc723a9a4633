//! Signing authorities.
//!
//! An authority owns one private key. The key never leaves this module: the
//! only outputs are signed certificates and public material.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use serde::{Deserialize, Serialize};
use ssh_key::certificate::{self, CertType};
use ssh_key::rand_core::OsRng;
use ssh_key::{PrivateKey, PublicKey};

use keysystem_core::{AuthorityName, PolicyError, PolicyResult};

/// Extensions `ssh-keygen` puts on user certificates by default.
const SSH_USER_EXTENSIONS: &[&str] = &[
    "permit-X11-forwarding",
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-user-rc",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthorityKind {
    #[serde(rename = "TLS")]
    Tls,
    #[serde(rename = "SSH")]
    Ssh,
}

impl fmt::Display for AuthorityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorityKind::Tls => f.write_str("TLS"),
            AuthorityKind::Ssh => f.write_str("SSH"),
        }
    }
}

/// Certificate fields resolved for one account under one grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issuance {
    pub common_name: String,
    pub allowed_names: Vec<String>,
    pub is_host: bool,
    pub lifespan: Duration,
}

impl Issuance {
    /// Whether a name requested by the client may appear in the certificate.
    pub fn permits(&self, name: &str) -> bool {
        (!self.common_name.is_empty() && self.common_name == name)
            || self.allowed_names.iter().any(|n| n == name)
    }
}

/// A named signing key of one kind.
pub enum Authority {
    Tls(TlsAuthority),
    Ssh(SshAuthority),
}

impl Authority {
    /// Load an authority from its private key and certificate/public key text.
    pub fn load(
        name: AuthorityName,
        kind: AuthorityKind,
        key: &str,
        cert: &str,
    ) -> PolicyResult<Self> {
        match kind {
            AuthorityKind::Tls => TlsAuthority::load(name, key, cert).map(Authority::Tls),
            AuthorityKind::Ssh => SshAuthority::load(name, key, cert).map(Authority::Ssh),
        }
    }

    pub fn name(&self) -> &AuthorityName {
        match self {
            Authority::Tls(a) => &a.name,
            Authority::Ssh(a) => &a.name,
        }
    }

    pub fn kind(&self) -> AuthorityKind {
        match self {
            Authority::Tls(_) => AuthorityKind::Tls,
            Authority::Ssh(_) => AuthorityKind::Ssh,
        }
    }

    /// CA certificate PEM (TLS) or CA public key line (SSH).
    pub fn public_material(&self) -> &str {
        match self {
            Authority::Tls(a) => &a.cert_pem,
            Authority::Ssh(a) => &a.public_key,
        }
    }

    pub fn sign(&self, request: &str, issuance: &Issuance) -> PolicyResult<String> {
        self.sign_at(request, issuance, Utc::now())
    }

    /// Sign `request` (a CSR for TLS, a public key line for SSH) with
    /// validity `[now, now + lifespan]`.
    pub fn sign_at(
        &self,
        request: &str,
        issuance: &Issuance,
        now: DateTime<Utc>,
    ) -> PolicyResult<String> {
        match self {
            Authority::Tls(a) => a.sign_csr(request, issuance, now),
            Authority::Ssh(a) => a.sign_public_key(request, issuance, now),
        }
    }

    pub fn as_tls(&self) -> Option<&TlsAuthority> {
        match self {
            Authority::Tls(a) => Some(a),
            Authority::Ssh(_) => None,
        }
    }
}

impl fmt::Debug for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authority")
            .field("name", self.name())
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TLS
// ─────────────────────────────────────────────────────────────────────────────

pub struct TlsAuthority {
    name: AuthorityName,
    key: KeyPair,
    /// Issuer handle rebuilt from the CA certificate; carries the subject DN
    /// and key identifier that issued certificates chain to.
    issuer: rcgen::Certificate,
    cert_pem: String,
}

impl TlsAuthority {
    pub fn load(name: AuthorityName, key_pem: &str, cert_pem: &str) -> PolicyResult<Self> {
        let key = KeyPair::from_pem(key_pem).map_err(|e| {
            PolicyError::config(format!("authority '{name}': unreadable private key: {e}"))
        })?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem).map_err(|e| {
            PolicyError::config(format!("authority '{name}': unreadable certificate: {e}"))
        })?;
        let issuer = params.self_signed(&key).map_err(|e| {
            PolicyError::config(format!("authority '{name}': key does not fit certificate: {e}"))
        })?;
        Ok(Self {
            name,
            key,
            issuer,
            cert_pem: cert_pem.to_string(),
        })
    }

    /// Sign a PEM CSR. Every name the CSR carries must be permitted by the
    /// issuance; the certificate itself always carries the issuance names.
    pub fn sign_csr(
        &self,
        csr_pem: &str,
        issuance: &Issuance,
        now: DateTime<Utc>,
    ) -> PolicyResult<String> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PolicyError::bad_request(format!("invalid signing request: {e}")))?;

        for name in requested_names(&csr.params)? {
            if !issuance.permits(&name) {
                return Err(PolicyError::bad_request(format!(
                    "requested name '{name}' is not allowed by this grant"
                )));
            }
        }

        csr.params = leaf_params(issuance, now)?;
        let cert = csr
            .signed_by(&self.issuer, &self.key)
            .map_err(|e| PolicyError::signing(format!("authority '{}': {e}", self.name)))?;
        Ok(cert.pem())
    }

    /// Generate a fresh key and certificate (used for the keyserver's own
    /// listening identity). Returns `(certificate_pem, private_key_pem)`.
    pub fn issue_identity(
        &self,
        issuance: &Issuance,
        now: DateTime<Utc>,
    ) -> PolicyResult<(String, String)> {
        let key = KeyPair::generate().map_err(|e| PolicyError::signing(e.to_string()))?;
        let cert = leaf_params(issuance, now)?
            .signed_by(&key, &self.issuer, &self.key)
            .map_err(|e| PolicyError::signing(format!("authority '{}': {e}", self.name)))?;
        Ok((cert.pem(), key.serialize_pem()))
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }
}

fn leaf_params(issuance: &Issuance, now: DateTime<Utc>) -> PolicyResult<CertificateParams> {
    let mut params = CertificateParams::default();

    params.distinguished_name = DistinguishedName::new();
    if !issuance.common_name.is_empty() {
        params
            .distinguished_name
            .push(DnType::CommonName, issuance.common_name.clone());
    }
    params.subject_alt_names = issuance
        .allowed_names
        .iter()
        .map(|name| subject_alt_name(name))
        .collect::<PolicyResult<_>>()?;

    params.not_before = offset_time(now)?;
    params.not_after = offset_time(expiry(now, issuance.lifespan)?)?;
    params.serial_number = Some(random_serial());
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![if issuance.is_host {
        ExtendedKeyUsagePurpose::ServerAuth
    } else {
        ExtendedKeyUsagePurpose::ClientAuth
    }];
    params.use_authority_key_identifier_extension = true;
    Ok(params)
}

fn subject_alt_name(name: &str) -> PolicyResult<SanType> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let dns = name
        .try_into()
        .map_err(|_| PolicyError::signing(format!("'{name}' is not a valid DNS name")))?;
    Ok(SanType::DnsName(dns))
}

fn requested_names(params: &CertificateParams) -> PolicyResult<Vec<String>> {
    let mut names = Vec::new();
    if let Some(cn) = params.distinguished_name.get(&DnType::CommonName) {
        let text = match cn {
            DnValue::Utf8String(s) => s.clone(),
            DnValue::PrintableString(s) => s.as_str().to_string(),
            DnValue::Ia5String(s) => s.as_str().to_string(),
            _ => {
                return Err(PolicyError::bad_request(
                    "unsupported common name encoding in signing request",
                ));
            }
        };
        names.push(text);
    }
    for san in &params.subject_alt_names {
        match san {
            SanType::DnsName(n) => names.push(n.as_str().to_string()),
            SanType::IpAddress(ip) => names.push(ip.to_string()),
            other => names.push(format!("{other:?}")),
        }
    }
    Ok(names)
}

fn expiry(now: DateTime<Utc>, lifespan: Duration) -> PolicyResult<DateTime<Utc>> {
    now.checked_add_signed(lifespan)
        .ok_or_else(|| PolicyError::signing("validity end out of range"))
}

fn offset_time(t: DateTime<Utc>) -> PolicyResult<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(t.timestamp())
        .map_err(|e| PolicyError::signing(format!("validity out of range: {e}")))
}

fn random_serial() -> SerialNumber {
    let mut bytes: [u8; 16] = rand::random();
    // Positive, fixed-length DER integer.
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    SerialNumber::from_slice(&bytes)
}

// ─────────────────────────────────────────────────────────────────────────────
// SSH
// ─────────────────────────────────────────────────────────────────────────────

pub struct SshAuthority {
    name: AuthorityName,
    key: PrivateKey,
    public_key: String,
}

impl SshAuthority {
    pub fn load(name: AuthorityName, key_text: &str, public_text: &str) -> PolicyResult<Self> {
        let key = PrivateKey::from_openssh(key_text).map_err(|e| {
            PolicyError::config(format!("authority '{name}': unreadable private key: {e}"))
        })?;
        if key.is_encrypted() {
            return Err(PolicyError::config(format!(
                "authority '{name}': encrypted private keys are not supported"
            )));
        }
        let public = PublicKey::from_openssh(public_text.trim()).map_err(|e| {
            PolicyError::config(format!("authority '{name}': unreadable public key: {e}"))
        })?;
        if public.key_data() != key.public_key().key_data() {
            return Err(PolicyError::config(format!(
                "authority '{name}': public key does not match private key"
            )));
        }
        Ok(Self {
            name,
            key,
            public_key: public_text.trim().to_string(),
        })
    }

    /// Sign an OpenSSH public key line. Principals are exactly the issuance's
    /// allowed names.
    pub fn sign_public_key(
        &self,
        request: &str,
        issuance: &Issuance,
        now: DateTime<Utc>,
    ) -> PolicyResult<String> {
        let subject = PublicKey::from_openssh(request.trim())
            .map_err(|e| PolicyError::bad_request(format!("invalid public key: {e}")))?;
        if issuance.allowed_names.is_empty() {
            return Err(PolicyError::signing("ssh certificates need at least one principal"));
        }

        let valid_after = unix_seconds(now)?;
        let valid_before = unix_seconds(expiry(now, issuance.lifespan)?)?;
        let signing = |e: ssh_key::Error| {
            PolicyError::signing(format!("authority '{}': {e}", self.name))
        };

        let mut builder = certificate::Builder::new_with_random_nonce(
            &mut OsRng,
            subject.key_data().clone(),
            valid_after,
            valid_before,
        )
        .map_err(signing)?;
        builder.serial(rand::random::<u64>()).map_err(signing)?;
        builder
            .key_id(issuance.common_name.clone())
            .map_err(signing)?;
        builder
            .cert_type(if issuance.is_host {
                CertType::Host
            } else {
                CertType::User
            })
            .map_err(signing)?;
        for principal in &issuance.allowed_names {
            builder.valid_principal(principal.clone()).map_err(signing)?;
        }
        if !issuance.is_host {
            for ext in SSH_USER_EXTENSIONS {
                builder.extension(*ext, "").map_err(signing)?;
            }
        }

        let cert = builder.sign(&self.key).map_err(signing)?;
        cert.to_openssh().map_err(signing)
    }
}

fn unix_seconds(t: DateTime<Utc>) -> PolicyResult<u64> {
    u64::try_from(t.timestamp())
        .map_err(|_| PolicyError::signing("validity before the unix epoch"))
}
