use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::{Instrument, debug, info_span};
use uuid::Uuid;

use keysystem_auth::AuthMethod;

use crate::app::AppState;
use crate::app::errors::{policy_error_to_response, unauthenticated};
use crate::context::{Identity, PeerInfo};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Wrap every request in a span carrying a fresh request id, echoed back in
/// the `x-request-id` response header.
pub async fn request_id_middleware(
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let request_id = Uuid::now_v7();
    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
        principal = tracing::field::Empty,
    );

    let mut res = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        res.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    res
}

/// Authenticate the caller by bearer token or client certificate, enforce
/// `limit-ip`, and attach the [`Identity`] plus the policy snapshot the
/// request will be served from.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let peer = peer_info(&req);
    let ctx = state.policy.snapshot();

    let authenticated = match extract_bearer(req.headers()) {
        Ok(Some(token)) => ctx
            .authenticate_token(token)
            .map(|account| (account, AuthMethod::BootstrapToken)),
        Ok(None) => match peer.client_principal.as_deref() {
            Some(cn) => ctx
                .authenticate_certificate(cn)
                .map(|account| (account, AuthMethod::ClientCertificate)),
            None => return unauthenticated("a bearer token or client certificate is required"),
        },
        Err(()) => return unauthenticated("malformed authorization header"),
    };

    let (account, method) = match authenticated {
        Ok(found) => found,
        Err(err) => {
            debug!(error = %err, "authentication failed");
            return unauthenticated("invalid credentials");
        }
    };

    if let Err(err) = ctx.admit(account, peer.ip()) {
        return policy_error_to_response(err);
    }

    let identity = Identity::new(account.principal.clone(), method);
    tracing::Span::current().record("principal", identity.principal().as_str());
    req.extensions_mut().insert(identity);
    req.extensions_mut().insert(ctx.clone());

    next.run(req).await
}

fn peer_info(req: &axum::http::Request<axum::body::Body>) -> PeerInfo {
    if let Some(peer) = req.extensions().get::<PeerInfo>() {
        return peer.clone();
    }
    PeerInfo {
        remote_addr: req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr),
        client_principal: None,
    }
}

/// `Ok(None)` when no `Authorization` header is present at all.
fn extract_bearer(headers: &HeaderMap) -> Result<Option<&str>, ()> {
    let Some(header) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Ok(None);
    };

    let header = header.to_str().map_err(|_| ())?;
    let token = header.strip_prefix("Bearer ").ok_or(())?.trim();
    if token.is_empty() {
        return Err(());
    }

    Ok(Some(token))
}
