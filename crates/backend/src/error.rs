//! Unified error handling for the backend API.
//!
//! This module provides a centralized error type that implements `IntoResponse`,
//! allowing handlers to use `?` operator naturally while returning appropriate
//! HTTP status codes and error messages.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::email::cipher::CipherError;

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Unified error type for API handlers
#[derive(Debug, Error)]
pub enum ApiError {
    /// Storage or provider failure
    #[error("{0}")]
    Internal(#[from] anyhow::Error),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// JSON parsing error
    #[error("Invalid JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Environment variable missing
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token could not be encrypted or decrypted
    #[error("Token cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Authentication required but not provided or invalid
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl ApiError {
    /// Create a bad request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    /// Create a config error for missing env vars
    pub fn missing_env(var_name: &str) -> Self {
        ApiError::Config(format!("{} environment variable must be set", var_name))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            ApiError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    Some(e.to_string()),
                )
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            ApiError::JsonParse(e) => {
                tracing::warn!("JSON parse error: {:?}", e);
                (
                    StatusCode::BAD_REQUEST,
                    "Invalid JSON format".to_string(),
                    Some(e.to_string()),
                )
            }
            ApiError::Config(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Server configuration error".to_string(),
                    None,
                )
            }
            ApiError::Cipher(e) => {
                tracing::error!("Token cipher error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Token encryption failure".to_string(),
                    None,
                )
            }
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone(), None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
