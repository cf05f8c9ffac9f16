//! Error Taxonomy
//! Mission: One place for every failure the API can surface

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Failures local to a venue adapter. These never abort the process; the
/// aggregator and the TWAP engine degrade around them.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("interval not supported by this exchange: {0}")]
    UnsupportedInterval(String),

    #[error("unknown trading pair: {0}")]
    UnknownSymbol(String),

    #[error("exchange unavailable: {0}")]
    UpstreamUnavailable(String),
}

/// Failures from the SQLite repository.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record already exists")]
    Duplicate,

    /// Also returned for rows owned by another user, so queries never leak
    /// whether a foreign order exists.
    #[error("record not found")]
    NotFound,

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("password hash error: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

/// HTTP-boundary error. Every handler failure collapses into one of these
/// and renders as the listed status code with a `{"detail": ...}` body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Duplicate(String),

    #[error("internal server error")]
    Internal(anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Duplicate(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(ref source) = self {
            tracing::error!(error = %source, "internal error at HTTP boundary");
        }
        let detail = self.to_string();
        (self.status(), Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate => ApiError::Duplicate("record already exists".to_string()),
            StoreError::NotFound => ApiError::NotFound("record not found".to_string()),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<ExchangeError> for ApiError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::UnsupportedInterval(i) => {
                ApiError::BadRequest(format!("interval not supported by this exchange: {i}"))
            }
            ExchangeError::UnknownSymbol(s) => {
                ApiError::NotFound(format!("trading pair not available on this exchange: {s}"))
            }
            ExchangeError::UpstreamUnavailable(msg) => {
                ApiError::Internal(anyhow::anyhow!("exchange unavailable: {msg}"))
            }
        }
    }
}
