//! Storage abstraction for email accounts.
//!
//! Jobs and handlers talk to [`AccountStore`] rather than to diesel directly,
//! so batch logic can run against the in-memory store in tests. Every method
//! is a single-row (or single-statement) write; nothing spans a transaction.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared_types::{AccountStatus, ConnectionStatus, EmailAccount, Provider};
use uuid::Uuid;

use crate::db::{email_accounts, DbPool};
use crate::models::{NewEmailAccountRow, StatusChangeset, TokenChangeset};

/// Input for creating or reconnecting an account after an OAuth callback
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub client_id: Uuid,
    pub provider: Provider,
    pub email_address: String,
    pub access_token_enc: String,
    pub refresh_token_enc: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Option<String>,
}

/// Freshly refreshed token material, already encrypted
#[derive(Debug, Clone)]
pub struct TokenUpdate {
    pub access_token_enc: String,
    pub refresh_token_enc: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Partial status update.
///
/// `last_error: None` leaves `last_error`/`last_error_at` untouched,
/// `Some(None)` clears both, `Some(Some(msg))` stores `msg` stamped with now.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: AccountStatus,
    pub last_error: Option<Option<String>>,
    pub connection_status: Option<ConnectionStatus>,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn list_for_client(&self, client_id: Uuid) -> Result<Vec<EmailAccount>>;

    async fn find_by_ms_subscription(&self, subscription_id: &str)
        -> Result<Option<EmailAccount>>;

    async fn list_ms_subscriptions_due(&self, before: DateTime<Utc>)
        -> Result<Vec<EmailAccount>>;

    async fn list_gmail_watches_due(&self, before: DateTime<Utc>) -> Result<Vec<EmailAccount>>;

    async fn upsert_connected(&self, connection: NewConnection) -> Result<EmailAccount>;

    async fn update_tokens(&self, account_id: Uuid, tokens: TokenUpdate) -> Result<()>;

    async fn update_gmail_watch(
        &self,
        account_id: Uuid,
        history_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn update_ms_subscription(
        &self,
        account_id: Uuid,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn mark_status(&self, account_id: Uuid, update: StatusUpdate) -> Result<()>;

    async fn touch_success(&self, account_id: Uuid) -> Result<()>;

    /// Returns false when the client had no account for `provider`.
    async fn disconnect(&self, client_id: Uuid, provider: Provider) -> Result<bool>;
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgAccountStore {
    pool: DbPool,
}

impl PgAccountStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl StatusUpdate {
    fn into_changeset(self, now: DateTime<Utc>) -> StatusChangeset {
        let last_error_at = self
            .last_error
            .as_ref()
            .map(|err| err.as_ref().map(|_| now));

        StatusChangeset {
            status: self.status.as_str().to_string(),
            last_error: self.last_error,
            last_error_at,
            connection_status: self
                .connection_status
                .map(|s| Some(s.as_str().to_string())),
            updated_at: now,
        }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn list_for_client(&self, client_id: Uuid) -> Result<Vec<EmailAccount>> {
        let mut conn = self.pool.get().await.context("Failed to get DB connection")?;
        email_accounts::list_by_client(&mut conn, client_id).await
    }

    async fn find_by_ms_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<EmailAccount>> {
        let mut conn = self.pool.get().await.context("Failed to get DB connection")?;
        email_accounts::get_by_ms_subscription(&mut conn, subscription_id).await
    }

    async fn list_ms_subscriptions_due(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<EmailAccount>> {
        let mut conn = self.pool.get().await.context("Failed to get DB connection")?;
        email_accounts::list_ms_subscriptions_due(&mut conn, before).await
    }

    async fn list_gmail_watches_due(&self, before: DateTime<Utc>) -> Result<Vec<EmailAccount>> {
        let mut conn = self.pool.get().await.context("Failed to get DB connection")?;
        email_accounts::list_gmail_watches_due(&mut conn, before).await
    }

    async fn upsert_connected(&self, connection: NewConnection) -> Result<EmailAccount> {
        let mut conn = self.pool.get().await.context("Failed to get DB connection")?;
        let row = NewEmailAccountRow {
            client_id: connection.client_id,
            provider: connection.provider.as_str().to_string(),
            email_address: connection.email_address,
            status: AccountStatus::Connected.as_str().to_string(),
            access_token_enc: Some(connection.access_token_enc),
            refresh_token_enc: connection.refresh_token_enc,
            expires_at: connection.expires_at,
            scopes: connection.scopes,
            last_success_at: Some(Utc::now()),
            connection_status: Some(ConnectionStatus::Ok.as_str().to_string()),
        };
        email_accounts::upsert_connected(&mut conn, row).await
    }

    async fn update_tokens(&self, account_id: Uuid, tokens: TokenUpdate) -> Result<()> {
        let mut conn = self.pool.get().await.context("Failed to get DB connection")?;
        let now = Utc::now();
        let changes = TokenChangeset {
            access_token_enc: Some(tokens.access_token_enc),
            refresh_token_enc: tokens.refresh_token_enc,
            expires_at: Some(tokens.expires_at),
            last_success_at: Some(now),
            updated_at: now,
        };
        email_accounts::update_tokens(&mut conn, account_id, changes).await
    }

    async fn update_gmail_watch(
        &self,
        account_id: Uuid,
        history_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut conn = self.pool.get().await.context("Failed to get DB connection")?;
        email_accounts::update_gmail_watch(&mut conn, account_id, history_id, expires_at).await
    }

    async fn update_ms_subscription(
        &self,
        account_id: Uuid,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.pool.get().await.context("Failed to get DB connection")?;
        email_accounts::update_ms_subscription(&mut conn, account_id, subscription_id, expires_at)
            .await
    }

    async fn mark_status(&self, account_id: Uuid, update: StatusUpdate) -> Result<()> {
        let mut conn = self.pool.get().await.context("Failed to get DB connection")?;
        email_accounts::update_status(&mut conn, account_id, update.into_changeset(Utc::now()))
            .await
    }

    async fn touch_success(&self, account_id: Uuid) -> Result<()> {
        let mut conn = self.pool.get().await.context("Failed to get DB connection")?;
        email_accounts::touch_success(&mut conn, account_id).await
    }

    async fn disconnect(&self, client_id: Uuid, provider: Provider) -> Result<bool> {
        let mut conn = self.pool.get().await.context("Failed to get DB connection")?;
        email_accounts::disconnect(&mut conn, client_id, provider).await
    }
}
