//! Gmail API client for push-notification watch registration.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_gmail1::api::WatchRequest;
use google_gmail1::hyper_rustls::HttpsConnector;
use google_gmail1::Gmail;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use shared_types::EmailAccount;
use std::sync::Arc;

use super::cipher::TokenCipher;
use crate::config::{GoogleConfig, OAuthClientConfig};

/// Result of a `users.watch` call
#[derive(Debug, Clone, PartialEq)]
pub struct WatchRegistration {
    pub history_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Registers (or re-registers) the Gmail push watch for an account.
#[async_trait]
pub trait GmailWatchApi: Send + Sync {
    async fn watch(&self, account: &EmailAccount) -> Result<WatchRegistration>;
}

/// Client for interacting with Gmail API
pub struct GmailClient {
    hub: Gmail<HttpsConnector<HttpConnector>>,
    pub email_address: String,
}

impl GmailClient {
    /// Create a new Gmail client from a decrypted refresh token
    pub async fn from_refresh_token(
        oauth: &OAuthClientConfig,
        refresh_token: String,
        email_address: &str,
    ) -> Result<Self> {
        // Build AuthorizedUserSecret with our stored refresh token
        // Use the yup_oauth2 re-exported by google_gmail1 to avoid version mismatch
        let secret = google_gmail1::yup_oauth2::authorized_user::AuthorizedUserSecret {
            client_id: oauth.client_id.clone(),
            client_secret: oauth.client_secret.clone(),
            refresh_token,
            key_type: "authorized_user".to_string(),
        };

        let auth = google_gmail1::yup_oauth2::AuthorizedUserAuthenticator::builder(secret)
            .build()
            .await
            .context("Failed to build authenticator from refresh token")?;

        let connector = google_gmail1::hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .context("Failed to load native TLS roots")?
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(connector);
        let hub = Gmail::new(client, auth);

        Ok(Self {
            hub,
            email_address: email_address.to_string(),
        })
    }

    /// Ask Gmail to publish INBOX changes to `topic_name`
    pub async fn watch(&self, topic_name: &str) -> Result<WatchRegistration> {
        let request = WatchRequest {
            topic_name: Some(topic_name.to_string()),
            label_ids: Some(vec!["INBOX".to_string()]),
            ..Default::default()
        };

        let (_, response) = self
            .hub
            .users()
            .watch(request, "me")
            .doit()
            .await
            .context("Failed to register Gmail watch")?;

        tracing::debug!(
            "Gmail watch registered for {} (history {:?})",
            self.email_address,
            response.history_id
        );

        Ok(WatchRegistration {
            history_id: response.history_id.map(|h| h.to_string()),
            expires_at: response
                .expiration
                .and_then(DateTime::<Utc>::from_timestamp_millis),
        })
    }
}

/// Production [`GmailWatchApi`]: decrypts the stored refresh token and calls Gmail.
pub struct GmailWatcher {
    google: Option<GoogleConfig>,
    cipher: Arc<TokenCipher>,
}

impl GmailWatcher {
    pub fn new(google: Option<GoogleConfig>, cipher: Arc<TokenCipher>) -> Self {
        Self { google, cipher }
    }
}

#[async_trait]
impl GmailWatchApi for GmailWatcher {
    async fn watch(&self, account: &EmailAccount) -> Result<WatchRegistration> {
        let google = self
            .google
            .as_ref()
            .context("Google OAuth is not configured")?;
        let topic = google
            .pubsub_topic
            .as_deref()
            .context("GMAIL_PUBSUB_TOPIC is not configured")?;

        let refresh_token_enc = account
            .refresh_token_enc
            .as_deref()
            .context("no stored credentials; reconnect required")?;
        let refresh_token = self
            .cipher
            .decrypt(refresh_token_enc)
            .context("Failed to decrypt Gmail refresh token")?;

        let client =
            GmailClient::from_refresh_token(&google.oauth, refresh_token, &account.email_address)
                .await?;
        client.watch(topic).await
    }
}
