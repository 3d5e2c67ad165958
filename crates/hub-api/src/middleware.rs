use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error};

use crate::auth::AppState;

/// Extract and verify the bearer token. On success the caller's
/// `Identity` is available to handlers as an `Extension`.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let identity = state.verifier.verify(&token).await.map_err(|e| {
        if e.is_unauthorized() {
            debug!("Rejected request to {}: {}", req.uri().path(), e);
            StatusCode::UNAUTHORIZED
        } else {
            error!("Token check failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    })?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
