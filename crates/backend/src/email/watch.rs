//! Gmail push-watch registration and scheduled refresh.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use shared_types::{AccountStatus, EmailAccount, Provider, WatchUpdate};
use uuid::Uuid;

use super::gmail::GmailWatchApi;
use super::status::record_failure;
use crate::repository::AccountStore;

/// Watches expiring within this window are re-registered by the scheduled job
pub const WATCH_REFRESH_LEAD_TIME_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct WatchRefreshReport {
    pub total: usize,
    pub failed: usize,
    pub updated: Vec<WatchUpdate>,
}

/// Register watches for every connected Google account of `client_id`.
///
/// Failing accounts are recorded and left out of the result.
pub async fn register_client_watches(
    store: &dyn AccountStore,
    gmail: &dyn GmailWatchApi,
    client_id: Uuid,
) -> Result<Vec<WatchUpdate>> {
    let accounts: Vec<EmailAccount> = store
        .list_for_client(client_id)
        .await
        .context("Failed to load email accounts")?
        .into_iter()
        .filter(|a| a.provider == Provider::Google && a.status == AccountStatus::Connected)
        .collect();

    let updates = join_all(accounts.iter().map(|a| register_watch(store, gmail, a))).await;
    Ok(updates.into_iter().flatten().collect())
}

/// Re-register every watch that is missing or lapses within the lead window of `now`.
pub async fn refresh_expiring_watches(
    store: &dyn AccountStore,
    gmail: &dyn GmailWatchApi,
    now: DateTime<Utc>,
) -> Result<WatchRefreshReport> {
    let due = store
        .list_gmail_watches_due(now + Duration::hours(WATCH_REFRESH_LEAD_TIME_HOURS))
        .await
        .context("Failed to load Gmail watches due for refresh")?;

    tracing::info!("Refreshing {} Gmail watches", due.len());

    let updated: Vec<WatchUpdate> = join_all(due.iter().map(|a| register_watch(store, gmail, a)))
        .await
        .into_iter()
        .flatten()
        .collect();

    let report = WatchRefreshReport {
        total: due.len(),
        failed: due.len() - updated.len(),
        updated,
    };
    tracing::info!(
        "Gmail watch refresh finished: {} of {} failed",
        report.failed,
        report.total
    );
    Ok(report)
}

/// Register one account's watch; `None` if it failed.
pub async fn register_watch(
    store: &dyn AccountStore,
    gmail: &dyn GmailWatchApi,
    account: &EmailAccount,
) -> Option<WatchUpdate> {
    match try_register(store, gmail, account).await {
        Ok(update) => Some(update),
        Err(err) => {
            record_failure(store, account, &err).await;
            None
        }
    }
}

async fn try_register(
    store: &dyn AccountStore,
    gmail: &dyn GmailWatchApi,
    account: &EmailAccount,
) -> Result<WatchUpdate> {
    let registration = gmail.watch(account).await?;

    // Re-registering returns the same historyId until the mailbox changes, so
    // an unchanged id only forces a write when the stored expiry is lapsing
    let history_changed = registration
        .history_id
        .as_deref()
        .is_some_and(|id| account.gmail_history_id.as_deref() != Some(id));
    let expiry_due = registration.expires_at.is_some()
        && watch_due(account.gmail_watch_expires_at, Utc::now());

    let history_id = registration
        .history_id
        .or_else(|| account.gmail_history_id.clone());

    if let Some(history_id) = history_id.as_deref() {
        if history_changed || expiry_due {
            store
                .update_gmail_watch(
                    account.id,
                    history_id,
                    registration.expires_at.or(account.gmail_watch_expires_at),
                )
                .await
                .context("Failed to save Gmail watch")?;
        }
    }

    Ok(WatchUpdate {
        id: account.id,
        email_address: account.email_address.clone(),
        gmail_history_id: history_id,
    })
}

/// Missing, or lapsing within the refresh lead window of `now`.
fn watch_due(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.map_or(true, |at| {
        at <= now + Duration::hours(WATCH_REFRESH_LEAD_TIME_HOURS)
    })
}
