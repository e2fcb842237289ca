//! Request authentication helpers for handlers.

use axum::http::{header, HeaderMap};

use crate::config::{AppConfig, SessionConfig};
use crate::error::ApiError;

use super::jwt;
use super::types::{AuthUser, Claims};

/// Header carrying the shared secret for scheduler-only endpoints
pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

fn extract_token_from_cookie(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;

    for cookie_str in cookie_header.split(';') {
        if let Ok(cookie) = cookie::Cookie::parse(cookie_str.trim()) {
            if cookie.name() == cookie_name {
                return Some(cookie.value().to_string());
            }
        }
    }

    None
}

fn extract_token_from_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|s| s.to_string())
}

/// Extract and validate the session user from request headers.
///
/// The session cookie wins over an `Authorization: Bearer` header.
pub fn extract_auth_user(headers: &HeaderMap, config: &SessionConfig) -> Result<AuthUser, ApiError> {
    let token = extract_token_from_cookie(headers, &config.cookie_name)
        .or_else(|| extract_token_from_header(headers))
        .ok_or_else(|| ApiError::Unauthorized("Missing authentication".to_string()))?;

    let claims: Claims = jwt::validate_token(config, &token)
        .map_err(|_| ApiError::Unauthorized("Invalid or expired token".to_string()))?;

    Ok(AuthUser {
        client_id: claims.sub,
        email: claims.email,
    })
}

/// Reject the request unless it carries the configured internal jobs token.
pub fn require_internal_token(headers: &HeaderMap, config: &AppConfig) -> Result<(), ApiError> {
    let expected = config
        .internal_jobs_token
        .as_deref()
        .ok_or_else(|| ApiError::missing_env("INTERNAL_JOBS_TOKEN"))?;

    let provided = headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing internal token".to_string()))?;

    if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        return Err(ApiError::Unauthorized("Invalid internal token".to_string()));
    }

    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
