//! The policy context: every authority, account, group and grant, compiled
//! once and then only read.
//!
//! Reloading builds a fresh context and swaps it into a [`PolicyHandle`];
//! a live context is never mutated. The token registry is the one piece of
//! state that survives a reload.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use keysystem_core::{AuthorityName, GrantApi, GroupName, PolicyError, PolicyResult, Principal};

use crate::account::Account;
use crate::authority::{Authority, AuthorityKind, Issuance};
use crate::config::PolicyConfig;
use crate::grant::{Grant, GrantEnv};
use crate::group::GroupGraph;
use crate::token::TokenRegistry;

/// Where authority key material comes from.
///
/// Paths are already joined onto `authoritydir`.
pub trait KeyMaterialSource: Send + Sync {
    fn read(&self, path: &Path) -> PolicyResult<String>;
}

/// How the caller of a request proved its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    BootstrapToken,
    ClientCertificate,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::BootstrapToken => "token",
            AuthMethod::ClientCertificate => "certificate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticFile {
    pub filename: String,
    pub filepath: PathBuf,
}

#[derive(Debug)]
pub struct PolicyContext {
    authorities: BTreeMap<AuthorityName, Arc<Authority>>,
    authentication_authority: Arc<Authority>,
    server_tls: Arc<Authority>,
    static_files: BTreeMap<String, StaticFile>,
    accounts: BTreeMap<Principal, Account>,
    groups: GroupGraph,
    grants: BTreeMap<GrantApi, Grant>,
    tokens: Arc<TokenRegistry>,
}

impl PolicyContext {
    pub fn build(config: &PolicyConfig, keys: &dyn KeyMaterialSource) -> PolicyResult<Self> {
        Self::build_with_registry(config, keys, Arc::new(TokenRegistry::new()))
    }

    /// Build a context that shares an existing token registry, so tokens
    /// issued before a reload stay valid after it.
    pub fn build_with_registry(
        config: &PolicyConfig,
        keys: &dyn KeyMaterialSource,
        tokens: Arc<TokenRegistry>,
    ) -> PolicyResult<Self> {
        let mut authorities = BTreeMap::new();
        for (name, authority) in &config.authorities {
            let name = AuthorityName::new(name.clone())?;
            let key = keys.read(&config.authoritydir.join(&authority.key))?;
            let cert = keys.read(&config.authoritydir.join(&authority.cert))?;
            let loaded = Authority::load(name.clone(), authority.kind, &key, &cert)?;
            authorities.insert(name, Arc::new(loaded));
        }

        let authentication_authority = designated_tls(
            &authorities,
            &config.authentication_authority,
            "authentication-authority",
        )?;
        let server_tls = designated_tls(&authorities, &config.servertls, "servertls")?;

        let mut static_files = BTreeMap::new();
        for filename in &config.staticfiles {
            if filename.is_empty()
                || filename.contains('/')
                || filename.contains('\\')
                || filename == "."
                || filename == ".."
            {
                return Err(PolicyError::config(format!(
                    "static file '{filename}' must be a plain file name"
                )));
            }
            let entry = StaticFile {
                filename: filename.clone(),
                filepath: config.staticdir.join(filename),
            };
            if static_files.insert(filename.clone(), entry).is_some() {
                return Err(PolicyError::config(format!(
                    "duplicate static file '{filename}'"
                )));
            }
        }

        let mut accounts = BTreeMap::new();
        for account in &config.accounts {
            let account = Account::from_config(account)?;
            let principal = account.principal.clone();
            if accounts.insert(principal.clone(), account).is_some() {
                return Err(PolicyError::config(format!(
                    "duplicate account '{principal}'"
                )));
            }
        }

        let group_defs = config
            .groups
            .iter()
            .map(|(name, group)| {
                let name = GroupName::new(name.clone())?;
                let parent = group
                    .as_ref()
                    .and_then(|g| g.subgroupof.clone())
                    .map(GroupName::new)
                    .transpose()?;
                Ok((name, parent))
            })
            .collect::<PolicyResult<Vec<_>>>()?;
        let groups = GroupGraph::build(
            group_defs,
            accounts.values().map(|a| (&a.principal, &a.group)),
        )?;

        let env = GrantEnv {
            authorities: &authorities,
            groups: &groups,
            accounts: &accounts,
            tokens: &tokens,
        };
        let mut grants = BTreeMap::new();
        for (api, grant) in &config.grants {
            let api = GrantApi::new(api.clone())?;
            let compiled = Grant::compile(api.clone(), grant, &env)?;
            grants.insert(api, compiled);
        }

        info!(
            authorities = authorities.len(),
            accounts = accounts.len(),
            groups = groups.len(),
            grants = grants.len(),
            static_files = static_files.len(),
            "policy loaded"
        );

        Ok(Self {
            authorities,
            authentication_authority,
            server_tls,
            static_files,
            accounts,
            groups,
            grants,
            tokens,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lookups
    // ─────────────────────────────────────────────────────────────────────────

    pub fn authority(&self, name: &str) -> PolicyResult<&Arc<Authority>> {
        self.authorities
            .get(name)
            .ok_or_else(|| PolicyError::not_found(format!("authority '{name}'")))
    }

    pub fn authorities(&self) -> impl Iterator<Item = &Arc<Authority>> {
        self.authorities.values()
    }

    pub fn authentication_authority(&self) -> &Authority {
        &self.authentication_authority
    }

    pub fn server_tls(&self) -> &Authority {
        &self.server_tls
    }

    pub fn static_file(&self, filename: &str) -> PolicyResult<&StaticFile> {
        self.static_files
            .get(filename)
            .ok_or_else(|| PolicyError::not_found(format!("static file '{filename}'")))
    }

    pub fn static_files(&self) -> impl Iterator<Item = &StaticFile> {
        self.static_files.values()
    }

    pub fn account(&self, principal: &str) -> PolicyResult<&Account> {
        self.accounts
            .get(principal)
            .ok_or_else(|| PolicyError::not_found(format!("account '{principal}'")))
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn groups(&self) -> &GroupGraph {
        &self.groups
    }

    pub fn grant(&self, api: &str) -> PolicyResult<&Grant> {
        self.grants
            .get(api)
            .ok_or_else(|| PolicyError::not_found(format!("grant '{api}'")))
    }

    pub fn grants(&self) -> impl Iterator<Item = &Grant> {
        self.grants.values()
    }

    pub fn tokens(&self) -> &Arc<TokenRegistry> {
        &self.tokens
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Authentication
    // ─────────────────────────────────────────────────────────────────────────

    pub fn authenticate_token(&self, token: &str) -> PolicyResult<&Account> {
        self.authenticate_token_at(token, Utc::now())
    }

    /// Resolve a bearer token to its account.
    ///
    /// `NotFound` for unknown or expired tokens and for subjects that no
    /// longer have an account; `Unauthorized` for accounts with
    /// `disable-direct-auth`.
    pub fn authenticate_token_at(&self, token: &str, now: DateTime<Utc>) -> PolicyResult<&Account> {
        let entry = self.tokens.lookup_token_at(token, now)?;
        let account = self
            .accounts
            .get(&entry.subject)
            .ok_or_else(|| PolicyError::not_found("unknown or expired token"))?;
        if account.disable_direct_auth {
            return Err(PolicyError::unauthorized(format!(
                "account '{}' cannot authenticate with a bootstrap token",
                account.principal
            )));
        }
        Ok(account)
    }

    /// Resolve the subject of a verified client certificate to its account.
    pub fn authenticate_certificate(&self, common_name: &str) -> PolicyResult<&Account> {
        self.accounts.get(common_name).ok_or_else(|| {
            PolicyError::unauthorized(format!("no account for certificate '{common_name}'"))
        })
    }

    /// Authenticate and enforce `limit-ip` in one step.
    pub fn admit<'a>(
        &'a self,
        account: &'a Account,
        peer: Option<IpAddr>,
    ) -> PolicyResult<&'a Account> {
        account.check_origin(peer)?;
        Ok(account)
    }

    /// Mint a bootstrap token for `principal` directly (operator path).
    pub fn issue_token(&self, principal: &str, ttl: Duration) -> PolicyResult<String> {
        let account = self.account(principal)?;
        if account.disable_direct_auth {
            return Err(PolicyError::unauthorized(format!(
                "account '{principal}' cannot authenticate with a bootstrap token"
            )));
        }
        Ok(self.tokens.grant_token(account.principal.clone(), ttl))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invocation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn invoke(
        &self,
        caller: &Account,
        method: AuthMethod,
        api: &str,
        request: &str,
    ) -> PolicyResult<String> {
        self.invoke_at(caller, method, api, request, Utc::now())
    }

    /// Run one grant for an authenticated caller.
    ///
    /// Token-authenticated callers are confined to grants signed by the
    /// authentication authority.
    pub fn invoke_at(
        &self,
        caller: &Account,
        method: AuthMethod,
        api: &str,
        request: &str,
        now: DateTime<Utc>,
    ) -> PolicyResult<String> {
        let grant = self.grant(api)?;
        if method == AuthMethod::BootstrapToken
            && !grant.uses_authority(&self.authentication_authority)
        {
            return Err(PolicyError::unauthorized(format!(
                "grant '{api}' is not available to token-authenticated callers"
            )));
        }
        grant.invoke_at(&caller.principal, request, now)
    }

    /// Key and certificate for the keyserver's own listener, issued by the
    /// `servertls` authority. The first name becomes the common name.
    pub fn issue_server_identity(
        &self,
        names: &[String],
        lifespan: Duration,
        now: DateTime<Utc>,
    ) -> PolicyResult<(String, String)> {
        let first = names
            .first()
            .ok_or_else(|| PolicyError::config("the server certificate needs at least one name"))?;
        let tls = self.server_tls.as_tls().ok_or_else(|| {
            PolicyError::config(format!("servertls '{}' is not a TLS authority", self.server_tls.name()))
        })?;
        let issuance = Issuance {
            common_name: first.clone(),
            allowed_names: names.to_vec(),
            is_host: true,
            lifespan,
        };
        tls.issue_identity(&issuance, now)
    }
}

fn designated_tls(
    authorities: &BTreeMap<AuthorityName, Arc<Authority>>,
    name: &str,
    field: &str,
) -> PolicyResult<Arc<Authority>> {
    let authority = authorities
        .get(name)
        .ok_or_else(|| PolicyError::config(format!("{field} names unknown authority '{name}'")))?;
    if authority.kind() != AuthorityKind::Tls {
        return Err(PolicyError::config(format!(
            "{field} '{name}' must be a TLS authority"
        )));
    }
    Ok(Arc::clone(authority))
}

/// The currently published context.
///
/// Readers take an `Arc` snapshot and never hold the lock across a request.
#[derive(Debug)]
pub struct PolicyHandle {
    current: RwLock<Arc<PolicyContext>>,
}

impl PolicyHandle {
    pub fn new(context: PolicyContext) -> Self {
        Self {
            current: RwLock::new(Arc::new(context)),
        }
    }

    pub fn snapshot(&self) -> Arc<PolicyContext> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Publish `next`; returns the context it replaced.
    pub fn replace(&self, next: PolicyContext) -> Arc<PolicyContext> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(next))
    }
}
