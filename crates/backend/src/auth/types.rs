//! Auth-related types.

use serde::{Deserialize, Serialize};
use shared_types::Provider;
use uuid::Uuid;

/// Session JWT claims issued by the hosted auth service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (tenant client id)
    pub sub: Uuid,
    pub email: Option<String>,
    pub aud: String,
    /// Issued at timestamp
    pub iat: i64,
    /// Expiration timestamp
    pub exp: i64,
}

/// Validated session user
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub client_id: Uuid,
    pub email: Option<String>,
}

/// Claims carried in the OAuth `state` parameter between start and callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthStateClaims {
    pub sub: Uuid,
    pub provider: Provider,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}
