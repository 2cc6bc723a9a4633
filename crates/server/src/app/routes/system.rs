use axum::{Extension, Json, http::StatusCode};

use crate::app::dto::WhoamiResponse;
use crate::context::Identity;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami(Extension(identity): Extension<Identity>) -> Json<WhoamiResponse> {
    Json(WhoamiResponse {
        principal: identity.principal().to_string(),
        method: identity.method().as_str().to_string(),
    })
}
