//! HTTP application wiring (axum router + shared state).
//!
//! - `routes/`: handlers, one file per area
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Router, routing::get};
use tower::ServiceBuilder;

use keysystem_auth::PolicyHandle;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;

#[derive(Clone)]
pub struct AppState {
    pub policy: Arc<PolicyHandle>,
}

impl AppState {
    pub fn new(policy: Arc<PolicyHandle>) -> Self {
        Self { policy }
    }
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(state: AppState) -> Router {
    // Authenticated routes: bearer token or client certificate.
    let protected = routes::router().layer(axum::middleware::from_fn_with_state(
        state.clone(),
        middleware::auth_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::public::router())
        .with_state(state)
        .merge(protected)
        .layer(ServiceBuilder::new().layer(axum::middleware::from_fn(
            middleware::request_id_middleware,
        )))
}
