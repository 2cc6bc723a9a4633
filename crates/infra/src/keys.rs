use std::fs;
use std::path::Path;

use keysystem_auth::KeyMaterialSource;
use keysystem_core::{PolicyError, PolicyResult};

/// Reads authority key material from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsKeySource;

impl KeyMaterialSource for FsKeySource {
    fn read(&self, path: &Path) -> PolicyResult<String> {
        fs::read_to_string(path)
            .map_err(|e| PolicyError::config(format!("cannot read {}: {e}", path.display())))
    }
}
