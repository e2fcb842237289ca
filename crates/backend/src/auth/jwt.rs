//! JWT validation for sessions and signing for OAuth state.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use shared_types::Provider;
use uuid::Uuid;

use super::types::{Claims, OAuthStateClaims};
use crate::config::SessionConfig;

const STATE_AUDIENCE: &str = "billybot-oauth-state";
const STATE_TTL_MINUTES: i64 = 10;

/// Validate a session token and return its claims.
pub fn validate_token(
    config: &SessionConfig,
    token: &str,
) -> Result<Claims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::default();
    validation.set_audience(&[config.audience.as_str()]);

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )?;

    Ok(token_data.claims)
}

/// Sign the `state` for an OAuth redirect so the callback can trust who started it.
pub fn create_state_token(
    config: &SessionConfig,
    client_id: Uuid,
    provider: Provider,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = OAuthStateClaims {
        sub: client_id,
        provider,
        aud: STATE_AUDIENCE.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::minutes(STATE_TTL_MINUTES)).timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
}

pub fn validate_state_token(
    config: &SessionConfig,
    token: &str,
) -> Result<OAuthStateClaims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::default();
    validation.set_audience(&[STATE_AUDIENCE]);

    let token_data = decode::<OAuthStateClaims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )?;

    Ok(token_data.claims)
}

/// Mint a session token the way the auth service does.
#[cfg(test)]
pub fn create_session_token(config: &SessionConfig, client_id: Uuid) -> String {
    let now = Utc::now();
    let claims = Claims {
        sub: client_id,
        email: Some("owner@example.com".to_string()),
        aud: config.audience.clone(),
        iat: now.timestamp(),
        exp: (now + Duration::hours(1)).timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .expect("should create token")
}
