// Database models for Diesel
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared_types::EmailAccount;
use uuid::Uuid;

/// Database representation of email_accounts.
/// Provider and status are stored as VARCHAR and parsed on the way out.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::email_accounts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct EmailAccountRow {
    pub id: Uuid,
    pub client_id: Uuid,
    pub provider: String,
    pub email_address: String,
    pub status: String,
    pub access_token_enc: Option<String>,
    pub refresh_token_enc: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Option<String>,
    pub gmail_history_id: Option<String>,
    pub gmail_watch_expires_at: Option<DateTime<Utc>>,
    pub ms_subscription_id: Option<String>,
    pub ms_subscription_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub connection_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<EmailAccountRow> for EmailAccount {
    type Error = anyhow::Error;

    fn try_from(row: EmailAccountRow) -> Result<Self, Self::Error> {
        Ok(EmailAccount {
            id: row.id,
            client_id: row.client_id,
            provider: row.provider.parse().map_err(|e: String| anyhow!(e))?,
            email_address: row.email_address,
            status: row.status.parse().map_err(|e: String| anyhow!(e))?,
            access_token_enc: row.access_token_enc,
            refresh_token_enc: row.refresh_token_enc,
            expires_at: row.expires_at,
            scopes: row.scopes,
            gmail_history_id: row.gmail_history_id,
            gmail_watch_expires_at: row.gmail_watch_expires_at,
            ms_subscription_id: row.ms_subscription_id,
            ms_subscription_expires_at: row.ms_subscription_expires_at,
            last_error: row.last_error,
            last_error_at: row.last_error_at,
            last_success_at: row.last_success_at,
            connection_status: row.connection_status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Insertable struct for a freshly connected account
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::email_accounts)]
pub struct NewEmailAccountRow {
    pub client_id: Uuid,
    pub provider: String,
    pub email_address: String,
    pub status: String,
    pub access_token_enc: Option<String>,
    pub refresh_token_enc: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub connection_status: Option<String>,
}

/// Applied when a (client, provider) pair reconnects.
/// `None` token fields leave the stored ciphertext in place.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = crate::schema::email_accounts)]
pub struct ReconnectChangeset {
    pub email_address: String,
    pub status: String,
    pub access_token_enc: Option<String>,
    pub refresh_token_enc: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Option<String>,
    pub last_error: Option<Option<String>>,
    pub last_error_at: Option<Option<DateTime<Utc>>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub connection_status: Option<Option<String>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = crate::schema::email_accounts)]
pub struct TokenChangeset {
    pub access_token_enc: Option<String>,
    pub refresh_token_enc: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Partial status update: `None` fields are left untouched,
/// `Some(None)` clears a nullable column.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = crate::schema::email_accounts)]
pub struct StatusChangeset {
    pub status: String,
    pub last_error: Option<Option<String>>,
    pub last_error_at: Option<Option<DateTime<Utc>>>,
    pub connection_status: Option<Option<String>>,
    pub updated_at: DateTime<Utc>,
}
