use axum::{
    Router,
    routing::{get, post},
};

pub mod grants;
pub mod public;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/apirequest", post(grants::apirequest))
}
