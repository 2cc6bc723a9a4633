//! Fixtures for tests in this crate and its dependents.
//!
//! Enabled with the `test_utils` feature.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};

use keysystem_core::{PolicyError, PolicyResult};

use crate::authority::AuthorityKind;
use crate::config::{AccountConfig, AuthorityConfig, GrantConfig, GroupConfig, PolicyConfig};
use crate::context::{KeyMaterialSource, PolicyContext};
use crate::grant::PrivilegeKind;

/// Private key plus certificate (TLS) or public key line (SSH).
#[derive(Debug, Clone)]
pub struct CaMaterial {
    pub key_pem: String,
    pub cert_pem: String,
}

pub fn generate_tls_ca(common_name: &str) -> CaMaterial {
    let key = KeyPair::generate().expect("generate CA key");
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let cert = params.self_signed(&key).expect("self-sign CA");
    CaMaterial {
        key_pem: key.serialize_pem(),
        cert_pem: cert.pem(),
    }
}

pub fn generate_ssh_ca() -> CaMaterial {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).expect("generate ssh CA key");
    CaMaterial {
        key_pem: key
            .to_openssh(LineEnding::LF)
            .expect("encode ssh CA key")
            .as_str()
            .to_owned(),
        cert_pem: key.public_key().to_openssh().expect("encode ssh CA public key"),
    }
}

/// A CSR with an empty subject whose SANs are `names`.
/// Returns `(csr_pem, private_key_pem)`.
pub fn tls_csr(names: &[&str]) -> (String, String) {
    let key = KeyPair::generate().expect("generate key");
    let mut params =
        CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
            .expect("csr params");
    params.distinguished_name = DistinguishedName::new();
    let csr = params
        .serialize_request(&key)
        .expect("serialize csr")
        .pem()
        .expect("encode csr");
    (csr, key.serialize_pem())
}

/// Key material held in memory, keyed by full path.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKeySource {
    files: HashMap<PathBuf, String>,
}

impl InMemoryKeySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        self.files.insert(path.into(), contents.into());
    }
}

impl KeyMaterialSource for InMemoryKeySource {
    fn read(&self, path: &Path) -> PolicyResult<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| PolicyError::config(format!("missing key material {}", path.display())))
    }
}

/// A small but complete cluster policy.
///
/// - `ruby-01.mit.edu` in `example-nodes` (subgroup of `nodes`), pinned to
///   `18.181.0.97`
/// - `bare.mit.edu` in `nodes`, no metadata
/// - `admin@MIT.EDU` in `admins`, `disable-direct-auth`
///
/// Grants: `renew-keygrant`, `grant-tls`, `grant-ssh`, `node-config`,
/// `bootstrap-node`.
pub struct PolicyFixture {
    pub config: PolicyConfig,
    pub keys: InMemoryKeySource,
    /// CA material by authority name.
    pub authorities: BTreeMap<String, CaMaterial>,
}

impl PolicyFixture {
    pub const AUTHORITY_DIR: &'static str = "/fixture/authorities";

    pub fn new() -> Self {
        let mut authorities = BTreeMap::new();
        authorities.insert("keygranting".to_string(), generate_tls_ca("keygranting"));
        authorities.insert("clustertls".to_string(), generate_tls_ca("clustertls"));
        authorities.insert("servertls".to_string(), generate_tls_ca("servertls"));
        authorities.insert("ssh-host".to_string(), generate_ssh_ca());

        let mut keys = InMemoryKeySource::new();
        let mut authority_configs = BTreeMap::new();
        for (name, material) in &authorities {
            let kind = if name == "ssh-host" {
                AuthorityKind::Ssh
            } else {
                AuthorityKind::Tls
            };
            let key = PathBuf::from(format!("{name}.key"));
            let cert = PathBuf::from(format!("{name}.pem"));
            keys.insert(Path::new(Self::AUTHORITY_DIR).join(&key), material.key_pem.clone());
            keys.insert(Path::new(Self::AUTHORITY_DIR).join(&cert), material.cert_pem.clone());
            authority_configs.insert(name.clone(), AuthorityConfig { kind, key, cert });
        }

        let config = PolicyConfig {
            authoritydir: PathBuf::from(Self::AUTHORITY_DIR),
            staticdir: PathBuf::from("/fixture/static"),
            authentication_authority: "keygranting".to_string(),
            servertls: "servertls".to_string(),
            staticfiles: vec!["cluster.conf".to_string()],
            authorities: authority_configs,
            accounts: vec![
                account(
                    "ruby-01.mit.edu",
                    "example-nodes",
                    true,
                    false,
                    &[("hostname", "ruby-01"), ("ip", "18.181.0.97")],
                ),
                account("bare.mit.edu", "nodes", false, false, &[]),
                account("admin@MIT.EDU", "admins", false, true, &[]),
            ],
            groups: BTreeMap::from([
                ("nodes".to_string(), None),
                (
                    "example-nodes".to_string(),
                    Some(GroupConfig {
                        subgroupof: Some("nodes".to_string()),
                    }),
                ),
                ("admins".to_string(), None),
            ]),
            grants: BTreeMap::from([
                (
                    "renew-keygrant".to_string(),
                    GrantConfig {
                        group: "nodes".to_string(),
                        privilege: PrivilegeKind::SignTls,
                        scope: String::new(),
                        authority: Some("keygranting".to_string()),
                        lifespan: Some("24h".to_string()),
                        ishost: false,
                        common_name: "(principal)".to_string(),
                        allowed_names: Vec::new(),
                        contents: None,
                    },
                ),
                (
                    "grant-tls".to_string(),
                    GrantConfig {
                        group: "nodes".to_string(),
                        privilege: PrivilegeKind::SignTls,
                        scope: "cluster".to_string(),
                        authority: Some("clustertls".to_string()),
                        lifespan: Some("4h".to_string()),
                        ishost: true,
                        common_name: "(hostname).mit.edu".to_string(),
                        allowed_names: vec![
                            "(hostname).mit.edu".to_string(),
                            "(hostname)".to_string(),
                            "(ip)".to_string(),
                        ],
                        contents: None,
                    },
                ),
                (
                    "grant-ssh".to_string(),
                    GrantConfig {
                        group: "nodes".to_string(),
                        privilege: PrivilegeKind::SignSsh,
                        scope: String::new(),
                        authority: Some("ssh-host".to_string()),
                        lifespan: Some("24h".to_string()),
                        ishost: true,
                        common_name: "(principal)".to_string(),
                        allowed_names: vec!["(principal)".to_string(), "(hostname)".to_string()],
                        contents: None,
                    },
                ),
                (
                    "node-config".to_string(),
                    GrantConfig {
                        group: "nodes".to_string(),
                        privilege: PrivilegeKind::StaticContent,
                        scope: String::new(),
                        authority: None,
                        lifespan: None,
                        ishost: false,
                        common_name: String::new(),
                        allowed_names: Vec::new(),
                        contents: Some("HOST_NODE=(hostname)\n".to_string()),
                    },
                ),
                (
                    "bootstrap-node".to_string(),
                    GrantConfig {
                        group: "admins".to_string(),
                        privilege: PrivilegeKind::Bootstrap,
                        scope: String::new(),
                        authority: None,
                        lifespan: Some("1h".to_string()),
                        ishost: false,
                        common_name: String::new(),
                        allowed_names: Vec::new(),
                        contents: None,
                    },
                ),
            ]),
        };

        Self {
            config,
            keys,
            authorities,
        }
    }

    pub fn context(&self) -> PolicyContext {
        PolicyContext::build(&self.config, &self.keys).expect("fixture policy builds")
    }

    pub fn authority(&self, name: &str) -> &CaMaterial {
        &self.authorities[name]
    }
}

impl Default for PolicyFixture {
    fn default() -> Self {
        Self::new()
    }
}

fn account(
    principal: &str,
    group: &str,
    limit_ip: bool,
    disable_direct_auth: bool,
    metadata: &[(&str, &str)],
) -> AccountConfig {
    AccountConfig {
        principal: principal.to_string(),
        group: group.to_string(),
        limit_ip,
        disable_direct_auth,
        metadata: metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}
