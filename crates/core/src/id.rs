//! Strongly-typed names used across the policy.
//!
//! Every configured object is addressed by a string name. Wrapping them keeps
//! a grant API identifier from being passed where a principal is expected.

use core::borrow::Borrow;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Identity of an account (e.g. `ruby-01.mit.edu`, `admin@EXAMPLE.ORG`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

/// Name of a group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupName(String);

/// API identifier of a grant (what clients put in `"api"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantApi(String);

/// Name of a signing authority.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorityName(String);

macro_rules! impl_name_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Build a name, rejecting empty or whitespace-padded input.
            pub fn new(value: impl Into<String>) -> Result<Self, PolicyError> {
                let value = value.into();
                if value.is_empty() {
                    return Err(PolicyError::config(format!("{} must not be empty", $name)));
                }
                if value.trim() != value {
                    return Err(PolicyError::config(format!(
                        "{} '{}' has surrounding whitespace",
                        $name, value
                    )));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Borrow<str> for $t {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = PolicyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

impl_name_newtype!(Principal, "principal");
impl_name_newtype!(GroupName, "group name");
impl_name_newtype!(GrantApi, "grant api");
impl_name_newtype!(AuthorityName, "authority name");
