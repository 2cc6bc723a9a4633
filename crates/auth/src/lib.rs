//! `keysystem-auth` — the authorization and issuance engine.
//!
//! This crate is decoupled from HTTP and from the filesystem: key material
//! arrives through [`KeyMaterialSource`] and requests arrive as plain strings.

pub mod account;
pub mod authority;
pub mod config;
pub mod context;
pub mod grant;
pub mod group;
pub mod template;
pub mod token;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use account::Account;
pub use authority::{Authority, AuthorityKind, Issuance, SshAuthority, TlsAuthority};
pub use config::{AccountConfig, AuthorityConfig, GrantConfig, GroupConfig, PolicyConfig};
pub use context::{AuthMethod, KeyMaterialSource, PolicyContext, PolicyHandle, StaticFile};
pub use grant::{Grant, Privilege, PrivilegeKind};
pub use group::{Group, GroupGraph};
pub use template::{Template, TemplateVars};
pub use token::{BootstrapToken, TokenRegistry};
