//! Configuration tree handed to the policy engine.
//!
//! This mirrors the keyserver YAML file one-to-one. Parsing the bytes is the
//! loader's job (`keysystem-infra`); turning the tree into a validated
//! [`PolicyContext`](crate::PolicyContext) is this crate's job.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::authority::AuthorityKind;
use crate::grant::PrivilegeKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PolicyConfig {
    pub authoritydir: PathBuf,
    pub staticdir: PathBuf,
    pub authentication_authority: String,
    pub servertls: String,
    #[serde(default)]
    pub staticfiles: Vec<String>,
    #[serde(default, deserialize_with = "unique_keys")]
    pub authorities: BTreeMap<String, AuthorityConfig>,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Groups without a parent are written as a bare key (`nodes:`), which
    /// deserializes to `None`.
    #[serde(default, deserialize_with = "unique_keys")]
    pub groups: BTreeMap<String, Option<GroupConfig>>,
    #[serde(default, deserialize_with = "unique_keys")]
    pub grants: BTreeMap<String, GrantConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AuthorityConfig {
    #[serde(rename = "type")]
    pub kind: AuthorityKind,
    /// Private key file, relative to `authoritydir`.
    pub key: PathBuf,
    /// Certificate (TLS) or public key (SSH) file, relative to `authoritydir`.
    pub cert: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AccountConfig {
    pub principal: String,
    pub group: String,
    #[serde(default)]
    pub limit_ip: bool,
    #[serde(default)]
    pub disable_direct_auth: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GroupConfig {
    pub subgroupof: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GrantConfig {
    pub group: String,
    pub privilege: PrivilegeKind,
    #[serde(default)]
    pub scope: String,
    pub authority: Option<String>,
    pub lifespan: Option<String>,
    #[serde(default)]
    pub ishost: bool,
    #[serde(default)]
    pub common_name: String,
    #[serde(default)]
    pub allowed_names: Vec<String>,
    pub contents: Option<String>,
}

/// Like the stock `BTreeMap` impl, but a repeated key is an error instead of
/// silently replacing the earlier entry.
fn unique_keys<'de, D, V>(deserializer: D) -> Result<BTreeMap<String, V>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    struct UniqueKeys<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for UniqueKeys<V> {
        type Value = BTreeMap<String, V>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map with unique names")
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(BTreeMap::new())
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut map = BTreeMap::new();
            while let Some(key) = access.next_key::<String>()? {
                if map.contains_key(&key) {
                    return Err(de::Error::custom(format!("duplicate name '{key}'")));
                }
                let value = access.next_value()?;
                map.insert(key, value);
            }
            Ok(map)
        }
    }

    deserializer.deserialize_map(UniqueKeys(PhantomData))
}
