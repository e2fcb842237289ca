//! Access-token cache in front of the provider token endpoints.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use shared_types::EmailAccount;
use std::sync::Arc;

use super::cipher::TokenCipher;
use super::oauth;
use crate::config::AppConfig;
use crate::repository::{AccountStore, TokenUpdate};

/// Stored access tokens this close to expiry are refreshed instead of reused.
pub const REFRESH_LEEWAY_SECS: i64 = 60;

pub struct TokenBroker {
    http: reqwest::Client,
    cipher: Arc<TokenCipher>,
    store: Arc<dyn AccountStore>,
    config: Arc<AppConfig>,
}

impl TokenBroker {
    pub fn new(
        http: reqwest::Client,
        cipher: Arc<TokenCipher>,
        store: Arc<dyn AccountStore>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            http,
            cipher,
            store,
            config,
        }
    }

    /// A usable access token for `account`, refreshing and persisting it if needed.
    pub async fn access_token(&self, account: &EmailAccount) -> Result<String> {
        if !needs_refresh(account, Utc::now()) {
            if let Some(token_enc) = account.access_token_enc.as_deref() {
                return Ok(self
                    .cipher
                    .decrypt(token_enc)
                    .context("Failed to decrypt access token")?);
            }
        }

        self.refresh(account).await
    }

    async fn refresh(&self, account: &EmailAccount) -> Result<String> {
        let refresh_token_enc = account
            .refresh_token_enc
            .as_deref()
            .context("no stored credentials; reconnect required")?;
        let refresh_token = self
            .cipher
            .decrypt(refresh_token_enc)
            .context("Failed to decrypt refresh token")?;

        let client = oauth::provider_client(&self.config, account.provider)?;
        let tokens = oauth::refresh_access_token(&self.http, &client, &refresh_token).await?;

        // Providers may rotate the refresh token; keep the old one otherwise
        let refresh_token_enc = tokens
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.encrypt(t))
            .transpose()?;
        let update = TokenUpdate {
            access_token_enc: self.cipher.encrypt(&tokens.access_token)?,
            refresh_token_enc,
            expires_at: tokens.expires_at(Utc::now()),
        };
        self.store
            .update_tokens(account.id, update)
            .await
            .context("Failed to save refreshed tokens")?;

        tracing::debug!("Refreshed access token for email account {}", account.id);
        Ok(tokens.access_token)
    }
}

/// Whether the stored access token is missing or within the leeway of expiry
pub fn needs_refresh(account: &EmailAccount, now: DateTime<Utc>) -> bool {
    match (&account.access_token_enc, account.expires_at) {
        (Some(_), Some(expires_at)) => {
            expires_at <= now + Duration::seconds(REFRESH_LEEWAY_SECS)
        }
        _ => true,
    }
}
