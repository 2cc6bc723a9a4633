//! Unauthenticated routes: authority public material and static files.

use std::io::ErrorKind;

use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::warn;

use crate::app::AppState;
use crate::app::errors::{json_error, policy_error_to_response};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/pub/:authority", get(public_material))
        .route("/static/:file", get(static_file))
}

pub async fn public_material(
    State(state): State<AppState>,
    Path(authority): Path<String>,
) -> Response {
    let ctx = state.policy.snapshot();
    match ctx.authority(&authority) {
        Ok(authority) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            authority.public_material().to_string(),
        )
            .into_response(),
        Err(err) => policy_error_to_response(err),
    }
}

pub async fn static_file(State(state): State<AppState>, Path(file): Path<String>) -> Response {
    let ctx = state.policy.snapshot();
    let entry = match ctx.static_file(&file) {
        Ok(entry) => entry.clone(),
        Err(err) => return policy_error_to_response(err),
    };

    match tokio::fs::read(&entry.filepath).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) if e.kind() == ErrorKind::NotFound => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("static file '{file}' is missing"),
        ),
        Err(e) => {
            warn!(file = %entry.filepath.display(), error = %e, "cannot read static file");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "io_error",
                format!("static file '{file}' is unreadable"),
            )
        }
    }
}
