use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

use crate::error::{AppError, AppResult};

/// Shared quota for the operator routes
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitLayer {
    pub fn per_minute(requests: u32) -> AppResult<Self> {
        let requests = NonZeroU32::new(requests)
            .ok_or_else(|| AppError::Config("rate limit must allow at least one request".into()))?;

        Ok(RateLimitLayer {
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(requests))),
        })
    }

    pub fn check(&self) -> AppResult<()> {
        self.limiter.check().map_err(|_| AppError::RateLimited)
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimitLayer>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Err(e) = limiter.check() {
        warn!("🚦 Rate limit hit on {} {}", req.method(), req.uri().path());
        return Err(e);
    }
    Ok(next.run(req).await)
}
