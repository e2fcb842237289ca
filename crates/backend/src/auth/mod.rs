//! Authentication for API routes.
//!
//! This module provides:
//! - Session JWT validation (cookie or bearer header)
//! - Signed OAuth `state` tokens for the provider connect flow
//! - The shared-secret check guarding internal job endpoints

pub mod jwt;
mod middleware;
pub mod types;

pub use middleware::{extract_auth_user, require_internal_token, INTERNAL_TOKEN_HEADER};
