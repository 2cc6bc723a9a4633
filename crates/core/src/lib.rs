//! `keysystem-core` — shared building blocks for the keyserver and keyclient.
//!
//! This crate holds the error taxonomy, the strongly-typed policy names and
//! lifespan parsing. It has no I/O and no cryptography.

pub mod error;
pub mod id;
pub mod lifespan;

pub use error::{PolicyError, PolicyResult};
pub use id::{AuthorityName, GrantApi, GroupName, Principal};
pub use lifespan::{MAX_LIFESPAN_DAYS, format_lifespan, parse_lifespan};
