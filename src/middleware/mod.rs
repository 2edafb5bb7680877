pub mod cors;
pub mod operator;
pub mod rate_limit;
pub mod validation;

pub use cors::create_cors_layer;
pub use operator::{require_operator, OPERATOR_TOKEN_HEADER};
pub use rate_limit::{rate_limit_middleware, RateLimitLayer};
pub use validation::ValidatedJson;
