use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Mail provider an account is connected through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Microsoft,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Microsoft => "microsoft",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" => Ok(Provider::Google),
            "microsoft" => Ok(Provider::Microsoft),
            other => Err(format!("unknown email provider: {}", other)),
        }
    }
}

/// Coarse persisted account state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Connected,
    Disconnected,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Connected => "connected",
            AccountStatus::Disconnected => "disconnected",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(AccountStatus::Connected),
            "disconnected" => Ok(AccountStatus::Disconnected),
            other => Err(format!("unknown account status: {}", other)),
        }
    }
}

/// Connection health derived from the stored account fields.
///
/// Computed on read; the `connection_status` column only caches the last
/// value a job wrote for display purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Ok,
    NeedsReconnect,
    WatchExpired,
    SubscriptionExpired,
    RefreshFailed,
    ProviderRevoked,
    Inactive,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Ok => "ok",
            ConnectionStatus::NeedsReconnect => "needs_reconnect",
            ConnectionStatus::WatchExpired => "watch_expired",
            ConnectionStatus::SubscriptionExpired => "subscription_expired",
            ConnectionStatus::RefreshFailed => "refresh_failed",
            ConnectionStatus::ProviderRevoked => "provider_revoked",
            ConnectionStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One connected mailbox per (client, provider).
///
/// Holds token ciphertext, so it deliberately does not implement `Serialize`;
/// use [`EmailAccountResponse`] for anything leaving the server.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailAccount {
    pub id: Uuid,
    pub client_id: Uuid,
    pub provider: Provider,
    pub email_address: String,
    pub status: AccountStatus,
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

// API Request/Response types for email account management
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAccountResponse {
    pub id: Uuid,
    pub provider: Provider,
    pub email_address: String,
    pub status: AccountStatus,
    pub connection_status: ConnectionStatus,
    pub scopes: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub gmail_watch_expires_at: Option<DateTime<Utc>>,
    pub ms_subscription_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEmailAccountsResponse {
    pub ok: bool,
    pub accounts: Vec<EmailAccountResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub provider: Provider,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthStartResponse {
    pub auth_url: String,
}

// Microsoft subscription renewal job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenewalOutcome {
    Renewed,
    Recreated,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRenewalResult {
    #[serde(rename = "accountId")]
    pub account_id: Uuid,
    pub status: RenewalOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalSummary {
    pub total: usize,
    pub renewed: usize,
    pub recreated: usize,
    pub failed: usize,
}

impl RenewalSummary {
    pub fn from_results(results: &[AccountRenewalResult]) -> Self {
        let mut summary = RenewalSummary {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            match result.status {
                RenewalOutcome::Renewed => summary.renewed += 1,
                RenewalOutcome::Recreated => summary.recreated += 1,
                RenewalOutcome::Error => summary.failed += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrosoftRenewalResponse {
    pub ok: bool,
    pub summary: RenewalSummary,
    pub results: Vec<AccountRenewalResult>,
}

// Gmail watch registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchUpdate {
    pub id: Uuid,
    pub email_address: String,
    pub gmail_history_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleWatchResponse {
    pub ok: bool,
    pub updated: Vec<WatchUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleWatchRefreshResponse {
    pub ok: bool,
    pub total: usize,
    pub failed: usize,
    pub updated: Vec<WatchUpdate>,
}
