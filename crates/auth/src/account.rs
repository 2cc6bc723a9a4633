use std::collections::BTreeMap;
use std::net::IpAddr;

use keysystem_core::{GroupName, PolicyError, PolicyResult, Principal};

use crate::config::AccountConfig;
use crate::template::TemplateVars;

/// An identity entitled to request certificates.
///
/// # Invariants
/// - Belongs to exactly one group (validated against the group graph at load).
/// - When `limit_ip` is set it holds the parsed `ip` metadata value.
/// - Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub principal: Principal,
    pub group: GroupName,
    pub metadata: BTreeMap<String, String>,
    pub limit_ip: Option<IpAddr>,
    pub disable_direct_auth: bool,
}

impl Account {
    pub fn from_config(config: &AccountConfig) -> PolicyResult<Self> {
        let principal = Principal::new(config.principal.clone())?;
        let group = GroupName::new(config.group.clone())?;

        let limit_ip = if config.limit_ip {
            let raw = config.metadata.get("ip").ok_or_else(|| {
                PolicyError::config(format!(
                    "account '{principal}' sets limit-ip but has no 'ip' metadata"
                ))
            })?;
            let ip = raw.parse::<IpAddr>().map_err(|_| {
                PolicyError::config(format!(
                    "account '{principal}' has unparsable 'ip' metadata '{raw}'"
                ))
            })?;
            Some(ip)
        } else {
            None
        };

        Ok(Self {
            principal,
            group,
            metadata: config.metadata.clone(),
            limit_ip,
            disable_direct_auth: config.disable_direct_auth,
        })
    }

    /// Short host name derived from a DNS-shaped principal
    /// (`ruby-01.mit.edu` → `ruby-01`). Kerberos-style principals have none.
    pub fn derived_hostname(&self) -> Option<&str> {
        let p = self.principal.as_str();
        if p.contains('@') {
            return None;
        }
        p.split('.').next().filter(|label| !label.is_empty())
    }

    /// Variables for grant templates: metadata first, then built-ins.
    pub fn template_vars(&self) -> TemplateVars<'_> {
        let mut vars =
            TemplateVars::new(&self.metadata).with_builtin("principal", self.principal.as_str());
        if let Some(hostname) = self.derived_hostname() {
            vars = vars.with_builtin("hostname", hostname);
        }
        if let Some(ip) = self.limit_ip {
            vars = vars.with_builtin("ip", ip.to_string());
        }
        vars
    }

    /// Reject requests arriving from anywhere but the pinned address.
    pub fn check_origin(&self, peer: Option<IpAddr>) -> PolicyResult<()> {
        let Some(expected) = self.limit_ip else {
            return Ok(());
        };
        match peer {
            Some(actual) if same_address(actual, expected) => Ok(()),
            _ => Err(PolicyError::unauthorized(format!(
                "account '{}' may only connect from its registered address",
                self.principal
            ))),
        }
    }
}

fn same_address(a: IpAddr, b: IpAddr) -> bool {
    let canonical = |ip: IpAddr| match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };
    canonical(a) == canonical(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Template;

    fn config(principal: &str, limit_ip: bool, meta: &[(&str, &str)]) -> AccountConfig {
        AccountConfig {
            principal: principal.to_string(),
            group: "nodes".to_string(),
            limit_ip,
            disable_direct_auth: false,
            metadata: meta
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn limit_ip_requires_parsable_ip() {
        assert!(Account::from_config(&config("a", true, &[])).is_err());
        assert!(Account::from_config(&config("a", true, &[("ip", "nope")])).is_err());
        let acct = Account::from_config(&config("a", true, &[("ip", "18.181.0.97")])).unwrap();
        assert_eq!(acct.limit_ip, Some("18.181.0.97".parse().unwrap()));
    }

    #[test]
    fn builtins_fill_in_missing_metadata() {
        let acct = Account::from_config(&config("ruby-01.mit.edu", false, &[])).unwrap();
        let vars = acct.template_vars();
        let t = Template::parse("(principal) (hostname)");
        assert_eq!(t.render(&vars).unwrap(), "ruby-01.mit.edu ruby-01");
        assert!(Template::parse("(ip)").render(&vars).is_err());
    }

    #[test]
    fn kerberos_principals_have_no_hostname() {
        let acct = Account::from_config(&config("admin@EXAMPLE.ORG", false, &[])).unwrap();
        assert_eq!(acct.derived_hostname(), None);
    }

    #[test]
    fn origin_check_only_applies_to_limited_accounts() {
        let open = Account::from_config(&config("a", false, &[])).unwrap();
        assert!(open.check_origin(None).is_ok());

        let pinned = Account::from_config(&config("b", true, &[("ip", "10.0.0.5")])).unwrap();
        assert!(pinned.check_origin(Some("10.0.0.5".parse().unwrap())).is_ok());
        assert!(pinned.check_origin(Some("::ffff:10.0.0.5".parse().unwrap())).is_ok());
        assert!(pinned.check_origin(Some("10.0.0.6".parse().unwrap())).is_err());
        assert!(pinned.check_origin(None).is_err());
    }
}
