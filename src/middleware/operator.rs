use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::api::AppState;
use crate::error::AppError;

pub const OPERATOR_TOKEN_HEADER: &str = "x-operator-token";

/// Gate for manual endpoints. With no token configured the endpoints are disabled outright.
pub async fn require_operator(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let expected = state
        .operator_token
        .as_deref()
        .ok_or(AppError::ManualDisabled)?;

    let provided = req
        .headers()
        .get(OPERATOR_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());

    match provided {
        Some(token) if tokens_match(token, expected) => Ok(next.run(req).await),
        _ => {
            warn!("🔒 Rejected operator request to {}", req.uri().path());
            Err(AppError::Unauthorized)
        }
    }
}

/// Compare without short-circuiting on the first differing byte
fn tokens_match(provided: &str, expected: &str) -> bool {
    let (a, b) = (provided.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
