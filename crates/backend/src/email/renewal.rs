//! Scheduled renewal of Microsoft Graph subscriptions.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use shared_types::{AccountRenewalResult, EmailAccount, RenewalOutcome, RenewalSummary};

use super::graph::{GraphSubscriptions, SubscriptionState};
use super::status::{classify, mark_account_status, record_failure};
use crate::repository::AccountStore;

/// Subscriptions expiring within this window are renewed
pub const RENEWAL_LEAD_TIME_HOURS: i64 = 12;

#[derive(Debug, Clone)]
pub struct RenewalReport {
    pub summary: RenewalSummary,
    pub results: Vec<AccountRenewalResult>,
}

/// Renew every subscription lapsing within the lead window of `now`.
///
/// Accounts are processed concurrently and each one's failure is recorded on
/// that account only; the batch itself fails only if the selection query does.
pub async fn renew_due_subscriptions(
    store: &dyn AccountStore,
    graph: &dyn GraphSubscriptions,
    now: DateTime<Utc>,
) -> Result<RenewalReport> {
    let due = store
        .list_ms_subscriptions_due(now + Duration::hours(RENEWAL_LEAD_TIME_HOURS))
        .await
        .context("Failed to load subscriptions due for renewal")?;

    tracing::info!("Renewing {} Microsoft subscriptions", due.len());

    let results: Vec<AccountRenewalResult> =
        join_all(due.iter().map(|account| renew_account(store, graph, account))).await;
    let summary = RenewalSummary::from_results(&results);

    tracing::info!(
        "Microsoft renewal finished: {} renewed, {} recreated, {} failed",
        summary.renewed,
        summary.recreated,
        summary.failed
    );

    Ok(RenewalReport { summary, results })
}

async fn renew_account(
    store: &dyn AccountStore,
    graph: &dyn GraphSubscriptions,
    account: &EmailAccount,
) -> AccountRenewalResult {
    let status = match try_renew(store, graph, account).await {
        Ok(outcome) => outcome,
        Err(err) => {
            record_failure(store, account, &err).await;
            RenewalOutcome::Error
        }
    };

    AccountRenewalResult {
        account_id: account.id,
        status,
    }
}

async fn try_renew(
    store: &dyn AccountStore,
    graph: &dyn GraphSubscriptions,
    account: &EmailAccount,
) -> Result<RenewalOutcome> {
    let renewed = graph.renew(account).await?;
    store
        .update_ms_subscription(account.id, &renewed.id, renewed.expires_at)
        .await
        .context("Failed to save renewed subscription")?;

    // A successful renewal supersedes whatever error the account carried
    if account.last_error.is_some() {
        let mut healed = account.clone();
        healed.last_error = None;
        healed.ms_subscription_expires_at = Some(renewed.expires_at);
        mark_account_status(
            store,
            account.id,
            account.status,
            Some(None),
            Some(classify(&healed)),
        )
        .await?;
    }

    if account.ms_subscription_id.as_deref() == Some(renewed.id.as_str()) {
        Ok(RenewalOutcome::Renewed)
    } else {
        Ok(RenewalOutcome::Recreated)
    }
}

/// Bring an account's subscription up after (re)connecting: renew the stored
/// one if present, otherwise create one. Failures are recorded on the account.
pub async fn ensure_subscription(
    store: &dyn AccountStore,
    graph: &dyn GraphSubscriptions,
    account: &EmailAccount,
) -> Option<SubscriptionState> {
    let result = async {
        let subscription = if account.ms_subscription_id.is_some() {
            graph.renew(account).await?
        } else {
            graph.subscribe(account).await?
        };
        store
            .update_ms_subscription(account.id, &subscription.id, subscription.expires_at)
            .await
            .context("Failed to save Graph subscription")?;
        Ok::<_, anyhow::Error>(subscription)
    }
    .await;

    match result {
        Ok(subscription) => Some(subscription),
        Err(err) => {
            record_failure(store, account, &err).await;
            None
        }
    }
}
