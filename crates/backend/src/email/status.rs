//! Connection health classification.
//!
//! `classify` is a pure function over the stored account fields. Rules are
//! evaluated in a fixed priority order and the first match wins, since an
//! account can be revoked *and* have a lapsed watch at the same time.
//!
//! Provider error text is matched against [`ERROR_RULES`]. Google and
//! Microsoft do not document these strings, so the table is versioned and
//! kept separate from the ordering logic.

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use shared_types::{AccountStatus, ConnectionStatus, EmailAccount, Provider};
use std::sync::OnceLock;
use uuid::Uuid;

use super::cipher::CipherError;
use crate::repository::{AccountStore, StatusUpdate};

/// Bump when [`ERROR_RULES`] changes.
pub const ERROR_RULES_VERSION: u32 = 2;

/// Stored at the front of `last_error` when a token could not be decrypted.
pub const TOKEN_UNDECRYPTABLE: &str = "token_undecryptable";

/// Regex over the lowercased `last_error`, in match priority order.
pub struct ErrorRule {
    pub status: ConnectionStatus,
    pub pattern: &'static str,
}

pub const ERROR_RULES: &[ErrorRule] = &[
    ErrorRule {
        status: ConnectionStatus::ProviderRevoked,
        pattern: r"invalid_grant|revoked|aadsts70008|aadsts50173|aadsts700082",
    },
    ErrorRule {
        status: ConnectionStatus::NeedsReconnect,
        pattern: r"token_undecryptable|interaction_required|consent_required|login_required|aadsts65001|aadsts50076|aadsts50079",
    },
    ErrorRule {
        status: ConnectionStatus::RefreshFailed,
        pattern: r"refresh[ _-]?token|failed to refresh|refresh failed",
    },
];

fn compiled_rules() -> &'static [(ConnectionStatus, Regex)] {
    static RULES: OnceLock<Vec<(ConnectionStatus, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        tracing::debug!(
            "Compiling {} email error rules (version {})",
            ERROR_RULES.len(),
            ERROR_RULES_VERSION
        );
        ERROR_RULES
            .iter()
            .map(|rule| {
                // Patterns are string literals; test_rule_table_compiles covers them
                let regex = Regex::new(rule.pattern).expect("error rule pattern must compile");
                (rule.status, regex)
            })
            .collect()
    })
}

/// Status implied by provider error text alone, if any rule matches.
pub fn match_error(last_error: Option<&str>) -> Option<ConnectionStatus> {
    let lowered = last_error?.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }
    compiled_rules()
        .iter()
        .find(|(_, regex)| regex.is_match(&lowered))
        .map(|(status, _)| *status)
}

pub fn classify(account: &EmailAccount) -> ConnectionStatus {
    classify_at(account, Utc::now())
}

pub fn classify_at(account: &EmailAccount, now: DateTime<Utc>) -> ConnectionStatus {
    if account.status == AccountStatus::Disconnected {
        return ConnectionStatus::Inactive;
    }

    if let Some(status) = match_error(account.last_error.as_deref()) {
        return status;
    }

    let has_refresh_token = account
        .refresh_token_enc
        .as_deref()
        .is_some_and(|t| !t.is_empty());
    if !has_refresh_token && account.status == AccountStatus::Connected {
        return ConnectionStatus::NeedsReconnect;
    }

    match account.provider {
        Provider::Google if lapsed(account.gmail_watch_expires_at, now) => {
            return ConnectionStatus::WatchExpired;
        }
        Provider::Microsoft if lapsed(account.ms_subscription_expires_at, now) => {
            return ConnectionStatus::SubscriptionExpired;
        }
        _ => {}
    }

    match account.status {
        AccountStatus::Connected => ConnectionStatus::Ok,
        AccountStatus::Disconnected => ConnectionStatus::Inactive,
    }
}

fn lapsed(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.is_some_and(|at| at <= now)
}

/// Persist a status change.
///
/// Omitted arguments leave their columns alone; `last_error: Some(None)`
/// clears the stored error and its timestamp.
pub async fn mark_account_status(
    store: &dyn AccountStore,
    account_id: Uuid,
    status: AccountStatus,
    last_error: Option<Option<String>>,
    connection_status: Option<ConnectionStatus>,
) -> Result<()> {
    store
        .mark_status(
            account_id,
            StatusUpdate {
                status,
                last_error,
                connection_status,
            },
        )
        .await
}

/// Text persisted as `last_error` for a failed provider call.
///
/// Cipher failures get the [`TOKEN_UNDECRYPTABLE`] prefix so the rule table
/// maps them to `needs_reconnect` on every later read.
pub fn stored_error(err: &anyhow::Error) -> String {
    let undecryptable = err
        .chain()
        .any(|cause| cause.downcast_ref::<CipherError>().is_some());
    if undecryptable {
        format!("{}: {:#}", TOKEN_UNDECRYPTABLE, err)
    } else {
        format!("{:#}", err)
    }
}

/// Status to cache after a provider call for `account` failed with `err`.
pub fn degraded_status(account: &EmailAccount, err: &anyhow::Error) -> ConnectionStatus {
    let mut failed = account.clone();
    failed.last_error = Some(stored_error(err));
    classify(&failed)
}

/// Record a per-account failure inside a batch job.
///
/// Bookkeeping failures are logged and swallowed so they never change the
/// outcome of the job that called this.
pub async fn record_failure(store: &dyn AccountStore, account: &EmailAccount, err: &anyhow::Error) {
    let message = stored_error(err);
    let derived = degraded_status(account, err);
    tracing::warn!(
        "Email account {} ({}) degraded to {}: {:#}",
        account.id,
        account.provider,
        derived,
        err
    );

    if let Err(write_err) = mark_account_status(
        store,
        account.id,
        account.status,
        Some(Some(message)),
        Some(derived),
    )
    .await
    {
        tracing::error!(
            "Failed to record error for email account {}: {:#}",
            account.id,
            write_err
        );
    }
}
