use std::net::{IpAddr, SocketAddr};

use keysystem_auth::AuthMethod;
use keysystem_core::Principal;

/// Transport-level facts about the connection a request arrived on.
///
/// Inserted by the TLS accept loop; for plain listeners it is derived from
/// `ConnectInfo` instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub remote_addr: Option<SocketAddr>,
    /// Common name of a client certificate that chained to the
    /// authentication authority.
    pub client_principal: Option<String>,
}

impl PeerInfo {
    pub fn ip(&self) -> Option<IpAddr> {
        self.remote_addr.map(|a| a.ip())
    }
}

/// Authenticated caller of a request.
///
/// Immutable; present for every route behind the auth middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    principal: Principal,
    method: AuthMethod,
}

impl Identity {
    pub fn new(principal: Principal, method: AuthMethod) -> Self {
        Self { principal, method }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }
}
