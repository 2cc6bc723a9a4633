//! Loading the keyserver policy file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use keysystem_auth::{PolicyConfig, PolicyContext, TokenRegistry};

use crate::error::InfraError;
use crate::keys::FsKeySource;

/// Parse policy YAML. Unknown fields are rejected.
pub fn parse_policy(text: &str) -> Result<PolicyConfig, serde_yaml::Error> {
    serde_yaml::from_str(text)
}

/// Read and parse the policy file. Relative `authoritydir` and `staticdir`
/// are resolved against the file's directory.
pub fn load_policy(path: &Path) -> Result<PolicyConfig, InfraError> {
    let text = fs::read_to_string(path).map_err(|e| InfraError::io(path, e))?;
    let mut config = parse_policy(&text).map_err(|e| InfraError::yaml(path, e))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    config.authoritydir = resolve(base, &config.authoritydir);
    config.staticdir = resolve(base, &config.staticdir);
    Ok(config)
}

/// Load the policy file and build a context from it, optionally keeping an
/// existing token registry.
pub fn load_context(
    path: &Path,
    tokens: Option<Arc<TokenRegistry>>,
) -> Result<PolicyContext, InfraError> {
    let config = load_policy(path)?;
    let keys = FsKeySource;
    let context = match tokens {
        Some(tokens) => PolicyContext::build_with_registry(&config, &keys, tokens)?,
        None => PolicyContext::build(&config, &keys)?,
    };
    info!(path = %path.display(), "policy file applied");
    Ok(context)
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
