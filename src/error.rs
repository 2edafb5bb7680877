use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Manual operations disabled")]
    ManualDisabled,

    #[error("Rate limit exceeded")]
    RateLimited,
}

/// Price feed errors
#[derive(Error, Debug, Clone)]
pub enum OracleError {
    #[error("Price feed unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Invalid price for {symbol}: {reason}")]
    InvalidPrice { symbol: String, reason: String },
}

/// Errors talking to the origin or remote ledger
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Call {operation} reverted: {reason}")]
    Reverted { operation: String, reason: String },

    #[error("Failed to decode {0}")]
    Decode(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Amount out of range: {0}")]
    AmountOutOfRange(String),
}

/// Saga failure taxonomy. Every variant knows how the coordinator should park the saga.
#[derive(Error, Debug, Clone)]
pub enum SagaError {
    #[error("Oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("Insufficient remote liquidity: required {required}, available {available}")]
    InsufficientRemoteLiquidity { required: u128, available: u128 },

    #[error("{operation} reverted{}: {reason}", .tx_hash.as_deref().map(|h| format!(" in {h}")).unwrap_or_default())]
    RemoteCallReverted {
        operation: String,
        tx_hash: Option<String>,
        reason: String,
    },

    #[error("Confirmation unknown for {operation} ({tx_hash})")]
    ConfirmationUnknown { operation: String, tx_hash: String },

    #[error("No recorded position for {0}")]
    NoPositionFound(String),

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Ledger store failure: {0}")]
    Ledger(String),

    #[error("Invalid step transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// How a failed step leaves its saga
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retryable,
    Unknown,
    Terminal,
}

impl SagaError {
    pub fn disposition(&self) -> Disposition {
        match self {
            SagaError::OracleUnavailable(_)
            | SagaError::InsufficientRemoteLiquidity { .. }
            | SagaError::RemoteCallReverted { .. }
            | SagaError::Transient(_)
            | SagaError::Ledger(_) => Disposition::Retryable,
            SagaError::ConfirmationUnknown { .. } => Disposition::Unknown,
            SagaError::NoPositionFound(_)
            | SagaError::Conversion(_)
            | SagaError::InvalidTransition { .. } => Disposition::Terminal,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SagaError::OracleUnavailable(_) => "ORACLE_UNAVAILABLE",
            SagaError::InsufficientRemoteLiquidity { .. } => "INSUFFICIENT_REMOTE_LIQUIDITY",
            SagaError::RemoteCallReverted { .. } => "REMOTE_CALL_REVERTED",
            SagaError::ConfirmationUnknown { .. } => "CONFIRMATION_UNKNOWN",
            SagaError::NoPositionFound(_) => "NO_POSITION_FOUND",
            SagaError::Conversion(_) => "CONVERSION_FAILED",
            SagaError::Transient(_) => "TRANSIENT",
            SagaError::Ledger(_) => "LEDGER_ERROR",
            SagaError::InvalidTransition { .. } => "INVALID_TRANSITION",
        }
    }
}

impl From<AppError> for SagaError {
    fn from(error: AppError) -> Self {
        SagaError::Ledger(error.to_string())
    }
}

impl From<ChainError> for SagaError {
    fn from(error: ChainError) -> Self {
        SagaError::Transient(error.to_string())
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                msg,
                None,
            ),
            AppError::InvalidAddress(addr) => (
                StatusCode::BAD_REQUEST,
                "INVALID_ADDRESS",
                format!("Invalid address: {}", addr),
                Some(serde_json::json!({ "address": addr })),
            ),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg, None),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Missing or invalid operator token".to_string(),
                None,
            ),
            AppError::ManualDisabled => (
                StatusCode::FORBIDDEN,
                "MANUAL_DISABLED",
                "Manual operations are disabled on this instance".to_string(),
                None,
            ),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "Rate limit exceeded. Please try again later.".to_string(),
                None,
            ),
            AppError::Oracle(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "ORACLE_UNAVAILABLE",
                e.to_string(),
                None,
            ),
            AppError::Chain(e) => (
                StatusCode::BAD_GATEWAY,
                "CHAIN_ERROR",
                e.to_string(),
                None,
            ),
            AppError::Saga(e) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                e.code(),
                e.to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
