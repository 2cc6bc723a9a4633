//! Private keys and signing requests.
//!
//! A key is generated once and reused for every renewal; only the
//! certificate beside it changes.

use std::path::Path;

use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use tracing::info;

use keysystem_infra::{PRIVATE_MODE, read_optional, write_atomic};

use crate::error::ClientError;

/// Load the TLS key at `path`, generating and persisting one if absent.
pub fn load_or_generate_tls(path: &Path) -> Result<KeyPair, ClientError> {
    if let Some(pem) = read_optional(path)? {
        return KeyPair::from_pem(&pem)
            .map_err(|e| ClientError::key(format!("{}: {e}", path.display())));
    }
    let key = KeyPair::generate().map_err(|e| ClientError::key(e.to_string()))?;
    write_atomic(path, key.serialize_pem().as_bytes(), PRIVATE_MODE)?;
    info!(path = %path.display(), "generated TLS key");
    Ok(key)
}

/// A PEM CSR with an empty subject. The keyserver fills in the subject and
/// names from the grant; `names` only asks for a subset of them.
pub fn tls_request(key: &KeyPair, names: &[String]) -> Result<String, ClientError> {
    let mut params =
        CertificateParams::new(names.to_vec()).map_err(|e| ClientError::key(e.to_string()))?;
    params.distinguished_name = DistinguishedName::new();
    params
        .serialize_request(key)
        .and_then(|csr| csr.pem())
        .map_err(|e| ClientError::key(format!("cannot build signing request: {e}")))
}

/// Load the SSH key at `path`, generating an ed25519 key if absent.
/// Returns the public key line to send to the keyserver.
pub fn load_or_generate_ssh(path: &Path) -> Result<String, ClientError> {
    let key = match read_optional(path)? {
        Some(text) => PrivateKey::from_openssh(&text)
            .map_err(|e| ClientError::key(format!("{}: {e}", path.display())))?,
        None => {
            let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
                .map_err(|e| ClientError::key(e.to_string()))?;
            let encoded = key
                .to_openssh(LineEnding::LF)
                .map_err(|e| ClientError::key(e.to_string()))?;
            write_atomic(path, encoded.as_bytes(), PRIVATE_MODE)?;
            info!(path = %path.display(), "generated SSH key");
            key
        }
    };
    key.public_key()
        .to_openssh()
        .map_err(|e| ClientError::key(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn tls_key_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");

        let first = load_or_generate_tls(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let second = load_or_generate_tls(&path).unwrap();
        assert_eq!(first.serialize_pem(), second.serialize_pem());
    }

    #[test]
    fn request_carries_only_asked_names() {
        let key = KeyPair::generate().unwrap();
        let pem = tls_request(&key, &["ruby-01.mit.edu".into()]).unwrap();
        let parsed = rcgen::CertificateSigningRequestParams::from_pem(&pem).unwrap();
        assert_eq!(parsed.params.subject_alt_names.len(), 1);
        assert!(parsed.params.distinguished_name.iter().next().is_none());
    }

    #[test]
    fn ssh_key_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh_host_ed25519_key");

        let first = load_or_generate_ssh(&path).unwrap();
        assert!(first.starts_with("ssh-ed25519 "));
        assert_eq!(load_or_generate_ssh(&path).unwrap(), first);
    }

    #[test]
    fn corrupt_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        std::fs::write(&path, "not a key").unwrap();
        assert!(matches!(load_or_generate_tls(&path), Err(ClientError::Key(_))));
    }
}
