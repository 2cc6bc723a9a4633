//! Grants and the per-account privileges they compile into.
//!
//! A grant names a target group and a privilege kind. At load time every
//! account in the group's membership closure gets its own [`Privilege`] with
//! all templates already rendered for that account. Invoking a grant is then
//! a lookup plus a `match` on the privilege.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use keysystem_core::{
    AuthorityName, GrantApi, GroupName, PolicyError, PolicyResult, Principal, parse_lifespan,
};

use crate::account::Account;
use crate::authority::{Authority, AuthorityKind, Issuance};
use crate::config::GrantConfig;
use crate::group::GroupGraph;
use crate::template::Template;
use crate::token::TokenRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrivilegeKind {
    /// Sign a CSR with a TLS authority.
    SignTls,
    /// Sign an OpenSSH public key with an SSH authority.
    SignSsh,
    /// Return the grant's `contents` rendered for the caller.
    StaticContent,
    /// Mint a bootstrap token for another account.
    Bootstrap,
}

impl PrivilegeKind {
    fn required_authority(self) -> Option<AuthorityKind> {
        match self {
            PrivilegeKind::SignTls => Some(AuthorityKind::Tls),
            PrivilegeKind::SignSsh => Some(AuthorityKind::Ssh),
            PrivilegeKind::StaticContent | PrivilegeKind::Bootstrap => None,
        }
    }

    fn needs_lifespan(self) -> bool {
        !matches!(self, PrivilegeKind::StaticContent)
    }
}

impl fmt::Display for PrivilegeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PrivilegeKind::SignTls => "sign-tls",
            PrivilegeKind::SignSsh => "sign-ssh",
            PrivilegeKind::StaticContent => "static-content",
            PrivilegeKind::Bootstrap => "bootstrap",
        })
    }
}

/// A grant bound to one account, with every template already resolved.
#[derive(Debug)]
pub enum Privilege {
    SignTls {
        authority: Arc<Authority>,
        issuance: Issuance,
    },
    SignSsh {
        authority: Arc<Authority>,
        issuance: Issuance,
    },
    StaticContent {
        contents: String,
    },
    Bootstrap {
        tokens: Arc<TokenRegistry>,
        lifespan: Duration,
        targets: BTreeSet<Principal>,
    },
}

impl Privilege {
    pub fn kind(&self) -> PrivilegeKind {
        match self {
            Privilege::SignTls { .. } => PrivilegeKind::SignTls,
            Privilege::SignSsh { .. } => PrivilegeKind::SignSsh,
            Privilege::StaticContent { .. } => PrivilegeKind::StaticContent,
            Privilege::Bootstrap { .. } => PrivilegeKind::Bootstrap,
        }
    }

    pub fn invoke(&self, request: &str) -> PolicyResult<String> {
        self.invoke_at(request, Utc::now())
    }

    pub fn invoke_at(&self, request: &str, now: DateTime<Utc>) -> PolicyResult<String> {
        match self {
            Privilege::SignTls {
                authority,
                issuance,
            }
            | Privilege::SignSsh {
                authority,
                issuance,
            } => authority.sign_at(request, issuance, now),
            Privilege::StaticContent { contents } => Ok(contents.clone()),
            Privilege::Bootstrap {
                tokens,
                lifespan,
                targets,
            } => {
                let target = request.trim();
                match targets.get(target) {
                    Some(principal) => {
                        Ok(tokens.grant_token_at(principal.clone(), *lifespan, now))
                    }
                    None => Err(PolicyError::unauthorized(format!(
                        "cannot issue a bootstrap token for '{target}'"
                    ))),
                }
            }
        }
    }

    /// Resolved issuance for signing privileges.
    pub fn issuance(&self) -> Option<&Issuance> {
        match self {
            Privilege::SignTls { issuance, .. } | Privilege::SignSsh { issuance, .. } => {
                Some(issuance)
            }
            Privilege::StaticContent { .. } | Privilege::Bootstrap { .. } => None,
        }
    }
}

/// Everything a grant needs from the rest of the policy while compiling.
pub struct GrantEnv<'a> {
    pub authorities: &'a BTreeMap<AuthorityName, Arc<Authority>>,
    pub groups: &'a GroupGraph,
    pub accounts: &'a BTreeMap<Principal, Account>,
    pub tokens: &'a Arc<TokenRegistry>,
}

/// A compiled grant.
#[derive(Debug)]
pub struct Grant {
    pub api: GrantApi,
    pub group: GroupName,
    pub kind: PrivilegeKind,
    pub scope: String,
    pub authority: Option<Arc<Authority>>,
    pub is_host: bool,
    pub lifespan: Option<Duration>,
    common_name: Template,
    allowed_names: Vec<Template>,
    contents: Option<Template>,
    /// One entry per member of the target group's closure. A template that
    /// failed to resolve for an account is kept as its error.
    privileges: BTreeMap<Principal, PolicyResult<Privilege>>,
}

impl Grant {
    pub fn compile(api: GrantApi, config: &GrantConfig, env: &GrantEnv<'_>) -> PolicyResult<Self> {
        let kind = config.privilege;
        let group = GroupName::new(config.group.clone())?;
        let members = env.groups.resolve_members(group.as_str()).map_err(|_| {
            PolicyError::config(format!("grant '{api}' targets unknown group '{group}'"))
        })?;

        let authority = match (kind.required_authority(), &config.authority) {
            (Some(expected), Some(name)) => {
                let authority = env.authorities.get(name.as_str()).ok_or_else(|| {
                    PolicyError::config(format!(
                        "grant '{api}' references unknown authority '{name}'"
                    ))
                })?;
                if authority.kind() != expected {
                    return Err(PolicyError::config(format!(
                        "grant '{api}' is {kind} but authority '{name}' is {}",
                        authority.kind()
                    )));
                }
                Some(Arc::clone(authority))
            }
            (Some(_), None) => {
                return Err(PolicyError::config(format!(
                    "grant '{api}' is {kind} and needs an authority"
                )));
            }
            (None, Some(name)) => {
                return Err(PolicyError::config(format!(
                    "grant '{api}' is {kind} and does not use authority '{name}'"
                )));
            }
            (None, None) => None,
        };

        let lifespan = match (kind.needs_lifespan(), &config.lifespan) {
            (true, Some(text)) => Some(parse_lifespan(text).map_err(|e| {
                PolicyError::config(format!("grant '{api}': {e}"))
            })?),
            (true, None) => {
                return Err(PolicyError::config(format!(
                    "grant '{api}' is {kind} and needs a lifespan"
                )));
            }
            (false, Some(_)) => {
                return Err(PolicyError::config(format!(
                    "grant '{api}' is {kind} and does not use a lifespan"
                )));
            }
            (false, None) => None,
        };

        match kind {
            PrivilegeKind::StaticContent if config.contents.is_none() => {
                return Err(PolicyError::config(format!(
                    "grant '{api}' is {kind} and needs contents"
                )));
            }
            PrivilegeKind::SignTls | PrivilegeKind::SignSsh | PrivilegeKind::Bootstrap
                if config.contents.is_some() =>
            {
                return Err(PolicyError::config(format!(
                    "grant '{api}' is {kind} and does not use contents"
                )));
            }
            PrivilegeKind::SignSsh if config.allowed_names.is_empty() => {
                return Err(PolicyError::config(format!(
                    "grant '{api}' is {kind} and needs at least one allowed name"
                )));
            }
            _ => {}
        }

        let mut grant = Self {
            api,
            group,
            kind,
            scope: config.scope.clone(),
            authority,
            is_host: config.ishost,
            lifespan,
            common_name: Template::parse(&config.common_name),
            allowed_names: config.allowed_names.iter().map(|t| Template::parse(t)).collect(),
            contents: config.contents.as_deref().map(Template::parse),
            privileges: BTreeMap::new(),
        };

        for principal in members {
            let account = env.accounts.get(principal).ok_or_else(|| {
                PolicyError::config(format!("group member '{principal}' has no account"))
            })?;
            let bound = grant.bind(account, env);
            if let Err(err) = &bound {
                warn!(grant = %grant.api, account = %principal, error = %err, "grant cannot be bound for account");
            }
            grant.privileges.insert(principal.clone(), bound);
        }

        debug!(
            grant = %grant.api,
            kind = %grant.kind,
            scope = %grant.scope,
            accounts = grant.privileges.len(),
            "compiled grant"
        );
        Ok(grant)
    }

    fn bind(&self, account: &Account, env: &GrantEnv<'_>) -> PolicyResult<Privilege> {
        let vars = account.template_vars();
        let allowed_names = self
            .allowed_names
            .iter()
            .map(|t| t.render(&vars))
            .collect::<PolicyResult<Vec<_>>>()?;

        match self.kind {
            PrivilegeKind::SignTls | PrivilegeKind::SignSsh => {
                let authority = self.authority.clone().ok_or_else(|| {
                    PolicyError::config(format!("grant '{}' lost its authority", self.api))
                })?;
                let lifespan = self.lifespan.ok_or_else(|| {
                    PolicyError::config(format!("grant '{}' lost its lifespan", self.api))
                })?;
                let issuance = Issuance {
                    common_name: self.common_name.render(&vars)?,
                    allowed_names,
                    is_host: self.is_host,
                    lifespan,
                };
                Ok(if self.kind == PrivilegeKind::SignTls {
                    Privilege::SignTls {
                        authority,
                        issuance,
                    }
                } else {
                    Privilege::SignSsh {
                        authority,
                        issuance,
                    }
                })
            }
            PrivilegeKind::StaticContent => {
                let contents = match &self.contents {
                    Some(t) => t.render(&vars)?,
                    None => String::new(),
                };
                Ok(Privilege::StaticContent { contents })
            }
            PrivilegeKind::Bootstrap => {
                let lifespan = self.lifespan.ok_or_else(|| {
                    PolicyError::config(format!("grant '{}' lost its lifespan", self.api))
                })?;
                let targets = env
                    .accounts
                    .values()
                    .filter(|a| !a.disable_direct_auth)
                    .filter(|a| {
                        allowed_names.is_empty()
                            || allowed_names.iter().any(|n| n == a.principal.as_str())
                    })
                    .map(|a| a.principal.clone())
                    .collect();
                Ok(Privilege::Bootstrap {
                    tokens: Arc::clone(env.tokens),
                    lifespan,
                    targets,
                })
            }
        }
    }

    /// The privilege bound for `principal`.
    ///
    /// `Unauthorized` if the account is outside the target group's closure;
    /// the stored `TemplateError` if its templates did not resolve.
    pub fn privilege_for(&self, principal: &Principal) -> PolicyResult<&Privilege> {
        match self.privileges.get(principal) {
            Some(Ok(privilege)) => Ok(privilege),
            Some(Err(err)) => Err(err.clone()),
            None => Err(PolicyError::unauthorized(format!(
                "'{principal}' is not entitled to '{}'",
                self.api
            ))),
        }
    }

    pub fn invoke(&self, principal: &Principal, request: &str) -> PolicyResult<String> {
        self.privilege_for(principal)?.invoke(request)
    }

    pub fn invoke_at(
        &self,
        principal: &Principal,
        request: &str,
        now: DateTime<Utc>,
    ) -> PolicyResult<String> {
        self.privilege_for(principal)?.invoke_at(request, now)
    }

    pub fn bound_accounts(&self) -> impl Iterator<Item = &Principal> {
        self.privileges.keys()
    }

    pub fn common_name_template(&self) -> &Template {
        &self.common_name
    }

    pub fn allowed_name_templates(&self) -> &[Template] {
        &self.allowed_names
    }

    pub fn contents_template(&self) -> Option<&Template> {
        self.contents.as_ref()
    }

    /// Whether the grant signs with `authority`.
    pub fn uses_authority(&self, authority: &Authority) -> bool {
        self.authority
            .as_ref()
            .is_some_and(|a| a.name() == authority.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PolicyContext;
    use crate::test_utils::PolicyFixture;

    fn rebuild(
        fixture: &PolicyFixture,
        api: &str,
        edit: impl FnOnce(&mut GrantConfig),
    ) -> PolicyResult<PolicyContext> {
        let mut config = fixture.config.clone();
        if let Some(grant) = config.grants.get_mut(api) {
            edit(grant);
        }
        PolicyContext::build(&config, &fixture.keys)
    }

    #[test]
    fn privilege_kinds_use_kebab_case() {
        let kind: PrivilegeKind = serde_json::from_str("\"static-content\"").unwrap();
        assert_eq!(kind, PrivilegeKind::StaticContent);
        assert_eq!(PrivilegeKind::SignSsh.to_string(), "sign-ssh");
    }

    #[test]
    fn binds_every_member_of_the_group_closure() {
        let fixture = PolicyFixture::new();
        let ctx = fixture.context();
        let grant = ctx.grant("node-config").unwrap();
        let bound: Vec<&str> = grant.bound_accounts().map(Principal::as_str).collect();
        assert_eq!(bound, ["bare.mit.edu", "ruby-01.mit.edu"]);
    }

    #[test]
    fn ssh_grant_needs_allowed_names() {
        let fixture = PolicyFixture::new();
        let err = rebuild(&fixture, "grant-ssh", |g| g.allowed_names.clear()).unwrap_err();
        assert!(matches!(err, PolicyError::Config(_)));
    }

    #[test]
    fn static_content_needs_contents_and_no_authority() {
        let fixture = PolicyFixture::new();
        assert!(matches!(
            rebuild(&fixture, "node-config", |g| g.contents = None),
            Err(PolicyError::Config(_))
        ));
        assert!(matches!(
            rebuild(&fixture, "node-config", |g| g.authority = Some("keygranting".into())),
            Err(PolicyError::Config(_))
        ));
    }

    #[test]
    fn lifespan_must_parse() {
        let fixture = PolicyFixture::new();
        assert!(matches!(
            rebuild(&fixture, "grant-tls", |g| g.lifespan = Some("forever".into())),
            Err(PolicyError::Config(_))
        ));
        assert!(matches!(
            rebuild(&fixture, "grant-tls", |g| g.lifespan = None),
            Err(PolicyError::Config(_))
        ));
        assert!(matches!(
            rebuild(&fixture, "grant-tls", |g| g.lifespan = Some("100000000d".into())),
            Err(PolicyError::Config(_))
        ));
    }

    #[test]
    fn unknown_authority_is_a_config_error() {
        let fixture = PolicyFixture::new();
        assert!(matches!(
            rebuild(&fixture, "grant-tls", |g| g.authority = Some("nowhere".into())),
            Err(PolicyError::Config(_))
        ));
    }

    #[test]
    fn ssh_privilege_signs_resolved_principals() {
        let fixture = PolicyFixture::new();
        let ctx = fixture.context();
        let ruby = Principal::new("ruby-01.mit.edu").unwrap();
        let grant = ctx.grant("grant-ssh").unwrap();
        let privilege = grant.privilege_for(&ruby).unwrap();
        assert_eq!(privilege.kind(), PrivilegeKind::SignSsh);
        assert_eq!(
            privilege.issuance().unwrap().allowed_names,
            ["ruby-01.mit.edu", "ruby-01"]
        );
    }

    #[test]
    fn bootstrap_targets_follow_allowed_names() {
        let fixture = PolicyFixture::new();
        let ctx = rebuild(&fixture, "bootstrap-node", |g| {
            g.allowed_names = vec!["bare.mit.edu".into()];
        })
        .unwrap();
        let admin = Principal::new("admin@MIT.EDU").unwrap();
        let grant = ctx.grant("bootstrap-node").unwrap();

        let now = Utc::now();
        let token = grant.invoke_at(&admin, "bare.mit.edu\n", now).unwrap();
        let entry = ctx.tokens().lookup_token_at(&token, now).unwrap();
        assert_eq!(entry.subject.as_str(), "bare.mit.edu");
        assert_eq!(entry.expires_at, now + Duration::hours(1));

        assert!(matches!(
            grant.invoke(&admin, "ruby-01.mit.edu"),
            Err(PolicyError::Unauthorized(_))
        ));
    }
}
