use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use keysystem_core::PolicyError;

pub fn policy_error_to_response(err: PolicyError) -> axum::response::Response {
    let status = match &err {
        PolicyError::Unauthorized(_) => StatusCode::FORBIDDEN,
        PolicyError::NotFound(_) => StatusCode::NOT_FOUND,
        PolicyError::BadRequest(_) => StatusCode::BAD_REQUEST,
        PolicyError::Config(_) | PolicyError::Template(_) | PolicyError::Signing(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let code = err.code();
    let message = match err {
        PolicyError::Config(m)
        | PolicyError::Unauthorized(m)
        | PolicyError::NotFound(m)
        | PolicyError::BadRequest(m)
        | PolicyError::Template(m)
        | PolicyError::Signing(m) => m,
    };
    json_error(status, code, message)
}

pub fn unauthenticated(message: impl Into<String>) -> axum::response::Response {
    json_error(StatusCode::UNAUTHORIZED, "unauthenticated", message)
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_every_policy_error() {
        let cases = [
            (PolicyError::unauthorized("x"), StatusCode::FORBIDDEN),
            (PolicyError::not_found("x"), StatusCode::NOT_FOUND),
            (PolicyError::bad_request("x"), StatusCode::BAD_REQUEST),
            (PolicyError::template("x"), StatusCode::INTERNAL_SERVER_ERROR),
            (PolicyError::signing("x"), StatusCode::INTERNAL_SERVER_ERROR),
            (PolicyError::config("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(policy_error_to_response(err).status(), status);
        }
        assert_eq!(unauthenticated("no").status(), StatusCode::UNAUTHORIZED);
    }
}
