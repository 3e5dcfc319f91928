use axum::{http::StatusCode, response::{IntoResponse, Response}};
use thiserror::Error;

use crate::quota::LedgerError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Message(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Db(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound => AppError::NotFound,
            LedgerError::AlreadyProcessed => {
                AppError::Conflict("payment already processed".into())
            }
            LedgerError::InvalidAmount(value) => {
                AppError::BadRequest(format!("amount must be positive, got {value}"))
            }
            LedgerError::UnknownProduct(product) => {
                AppError::BadRequest(format!("unknown product `{product}`"))
            }
            LedgerError::Storage(err) => AppError::Db(err),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
