//! Infrastructure layer: policy files, key material on disk and atomic
//! persistence.

pub mod error;
pub mod keys;
pub mod persist;
pub mod policy;

pub use error::InfraError;
pub use keys::FsKeySource;
pub use persist::{PRIVATE_MODE, PUBLIC_MODE, read_optional, remove_if_exists, write_atomic};
pub use policy::{load_context, load_policy, parse_policy};
