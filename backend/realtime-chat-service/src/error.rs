use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use crypto_core::CryptoError;
use serde::Serialize;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("redis error: {0}")]
    Redis(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal server error")]
    Internal,
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Redis(e.to_string())
    }
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::BadRequest(e.to_string())
    }
}

impl AppError {
    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized => 401,
            AppError::NotFound => 404,
            AppError::Crypto(CryptoError::Unauthorized) => 401,
            AppError::Crypto(CryptoError::NoKeyMaterial(_)) => 404,
            AppError::Crypto(
                CryptoError::InvalidKeyLength { .. }
                | CryptoError::WeakKey
                | CryptoError::AuthenticationFailure,
            ) => 400,
            AppError::Redis(_)
            | AppError::Database(_)
            | AppError::Crypto(CryptoError::KeyDirectory(_)) => 503,
            _ => 500,
        }
    }

    /// Stable machine-readable code, shared by HTTP bodies and WebSocket `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_)
            | AppError::StartServer(_)
            | AppError::Internal
            | AppError::Crypto(CryptoError::InvalidKeyFormat(_)) => "INTERNAL_ERROR",
            AppError::BadRequest(_) => "INVALID_REQUEST",
            AppError::Unauthorized | AppError::Crypto(CryptoError::Unauthorized) => "UNAUTHORIZED",
            AppError::NotFound => "NOT_FOUND",
            AppError::Crypto(CryptoError::NoKeyMaterial(_)) => "NO_KEY_MATERIAL",
            AppError::Crypto(CryptoError::InvalidKeyLength { .. }) => "INVALID_KEY_LENGTH",
            AppError::Crypto(CryptoError::WeakKey) => "WEAK_KEY",
            AppError::Crypto(CryptoError::AuthenticationFailure) => "AUTHENTICATION_FAILURE",
            AppError::Redis(_)
            | AppError::Database(_)
            | AppError::Crypto(CryptoError::KeyDirectory(_)) => "STORAGE_UNAVAILABLE",
            AppError::Crypto(_) => "CRYPTO_ERROR",
        }
    }

    /// Message safe to hand back to a client. Storage and startup details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Redis(_)
            | AppError::Database(_)
            | AppError::Crypto(CryptoError::KeyDirectory(_)) => "storage unavailable".to_string(),
            AppError::Config(_)
            | AppError::StartServer(_)
            | AppError::Crypto(CryptoError::InvalidKeyFormat(_)) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    pub code: &'static str,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        let status = ResponseError::status_code(self);
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        HttpResponse::build(status).json(ErrorResponse {
            error: status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            message: self.public_message(),
            status: status.as_u16(),
            code: self.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(AppError::Unauthorized.status_code(), 401);
        assert_eq!(AppError::from(CryptoError::Unauthorized).status_code(), 401);
        assert_eq!(
            AppError::from(CryptoError::NoKeyMaterial(Uuid::nil())).status_code(),
            404
        );
        assert_eq!(AppError::Redis("down".into()).status_code(), 503);
        assert_eq!(AppError::Internal.status_code(), 500);
    }

    #[test]
    fn test_storage_details_are_not_exposed() {
        let err = AppError::Database("password authentication failed for user nova".into());
        assert_eq!(err.public_message(), "storage unavailable");
        assert_eq!(err.code(), "STORAGE_UNAVAILABLE");

        let err = AppError::from(CryptoError::KeyDirectory("relation does not exist".into()));
        assert_eq!(err.status_code(), 503);
        assert_eq!(err.public_message(), "storage unavailable");
    }

    #[test]
    fn test_key_format_errors_stay_internal() {
        let err = AppError::from(CryptoError::InvalidKeyFormat("InvalidKeyFormat".into()));
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert_eq!(err.public_message(), "internal server error");
    }

    #[test]
    fn test_error_response_body() {
        let resp = AppError::NotFound.error_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
