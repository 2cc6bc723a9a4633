use std::sync::Arc;

use axum::{
    Extension, Json,
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use keysystem_auth::PolicyContext;

use crate::app::dto::ApiRequest;
use crate::app::errors::policy_error_to_response;
use crate::context::Identity;

/// Run a batch of grant invocations for the caller.
///
/// All-or-nothing: the first failing entry fails the whole call.
pub async fn apirequest(
    Extension(identity): Extension<Identity>,
    Extension(ctx): Extension<Arc<PolicyContext>>,
    Json(batch): Json<Vec<ApiRequest>>,
) -> Response {
    let span = tracing::Span::current();
    let outcome =
        tokio::task::spawn_blocking(move || span.in_scope(|| run_batch(&ctx, &identity, &batch)))
            .await;
    match outcome {
        Ok(Ok(results)) => Json(results).into_response(),
        Ok(Err(err)) => policy_error_to_response(err),
        Err(join) => policy_error_to_response(keysystem_core::PolicyError::signing(format!(
            "request worker failed: {join}"
        ))),
    }
}

fn run_batch(
    ctx: &PolicyContext,
    identity: &Identity,
    batch: &[ApiRequest],
) -> keysystem_core::PolicyResult<Vec<String>> {
    let account = ctx.account(identity.principal().as_str())?;
    batch
        .iter()
        .map(|request| {
            match ctx.invoke(account, identity.method(), &request.api, &request.body) {
                Ok(result) => {
                    info!(
                        principal = %account.principal,
                        api = %request.api,
                        method = identity.method().as_str(),
                        "grant invoked"
                    );
                    Ok(result)
                }
                Err(err) => {
                    warn!(
                        principal = %account.principal,
                        api = %request.api,
                        error = %err,
                        "grant refused"
                    );
                    Err(err)
                }
            }
        })
        .collect()
}
