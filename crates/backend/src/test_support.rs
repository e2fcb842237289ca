//! Shared fixtures for unit tests: a deterministic cipher, account builders,
//! an in-memory [`AccountStore`] and scripted provider fakes.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use shared_types::{AccountStatus, EmailAccount, Provider};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::email::cipher::TokenCipher;
use crate::email::gmail::{GmailWatchApi, WatchRegistration};
use crate::email::graph::{GraphSubscriptions, SubscriptionState};
use crate::email::oauth::{ConnectedMailbox, OAuthExchange, ProviderClient, TokenResponse};
use crate::repository::{AccountStore, NewConnection, StatusUpdate, TokenUpdate};

/// base64 of the 32 ASCII bytes `0123456789abcdef0123456789abcdef`
pub const TEST_KEY_B64: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

pub fn test_cipher() -> TokenCipher {
    TokenCipher::from_base64_key(TEST_KEY_B64).unwrap()
}

/// A healthy connected account with encrypted tokens and no provider state.
pub fn account(provider: Provider) -> EmailAccount {
    let cipher = test_cipher();
    let now = Utc::now();
    EmailAccount {
        id: Uuid::new_v4(),
        client_id: Uuid::new_v4(),
        provider,
        email_address: format!("user-{}@example.com", provider),
        status: AccountStatus::Connected,
        access_token_enc: Some(cipher.encrypt("access-token").unwrap()),
        refresh_token_enc: Some(cipher.encrypt("refresh-token").unwrap()),
        expires_at: Some(now + Duration::hours(1)),
        scopes: None,
        gmail_history_id: None,
        gmail_watch_expires_at: None,
        ms_subscription_id: None,
        ms_subscription_expires_at: None,
        last_error: None,
        last_error_at: None,
        last_success_at: None,
        connection_status: None,
        created_at: now,
        updated_at: now,
    }
}

/// Microsoft account whose subscription `sub_id` lapses `expires_in` from now.
pub fn ms_account(sub_id: &str, expires_in: Duration) -> EmailAccount {
    let mut acct = account(Provider::Microsoft);
    acct.ms_subscription_id = Some(sub_id.to_string());
    acct.ms_subscription_expires_at = Some(Utc::now() + expires_in);
    acct
}

/// [`AccountStore`] over a `Vec`, counting every mutating call.
#[derive(Default)]
pub struct InMemoryStore {
    accounts: Mutex<Vec<EmailAccount>>,
    writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn with_accounts(accounts: Vec<EmailAccount>) -> Self {
        Self {
            accounts: Mutex::new(accounts),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn account(&self, id: Uuid) -> EmailAccount {
        self.accounts
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .expect("account exists")
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn modify(&self, id: Uuid, f: impl FnOnce(&mut EmailAccount)) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut accounts = self.accounts.lock().unwrap();
        let acct = accounts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| anyhow!("email account {} not found", id))?;
        f(acct);
        acct.updated_at = Utc::now();
        Ok(())
    }

    fn select(&self, pred: impl Fn(&EmailAccount) -> bool) -> Vec<EmailAccount> {
        self.accounts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| pred(a))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AccountStore for InMemoryStore {
    async fn list_for_client(&self, client_id: Uuid) -> Result<Vec<EmailAccount>> {
        Ok(self.select(|a| a.client_id == client_id))
    }

    async fn find_by_ms_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<EmailAccount>> {
        Ok(self
            .select(|a| a.ms_subscription_id.as_deref() == Some(subscription_id))
            .pop())
    }

    async fn list_ms_subscriptions_due(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<EmailAccount>> {
        Ok(self.select(|a| {
            a.provider == Provider::Microsoft
                && a.ms_subscription_id.is_some()
                && a.ms_subscription_expires_at.is_some_and(|at| at <= before)
        }))
    }

    async fn list_gmail_watches_due(&self, before: DateTime<Utc>) -> Result<Vec<EmailAccount>> {
        Ok(self.select(|a| {
            a.provider == Provider::Google
                && a.status == AccountStatus::Connected
                && a.gmail_watch_expires_at.map_or(true, |at| at <= before)
        }))
    }

    async fn upsert_connected(&self, connection: NewConnection) -> Result<EmailAccount> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let mut accounts = self.accounts.lock().unwrap();

        if let Some(acct) = accounts
            .iter_mut()
            .find(|a| a.client_id == connection.client_id && a.provider == connection.provider)
        {
            acct.email_address = connection.email_address;
            acct.status = AccountStatus::Connected;
            acct.access_token_enc = Some(connection.access_token_enc);
            if connection.refresh_token_enc.is_some() {
                acct.refresh_token_enc = connection.refresh_token_enc;
            }
            acct.expires_at = connection.expires_at.or(acct.expires_at);
            acct.scopes = connection.scopes.or(acct.scopes.take());
            acct.last_error = None;
            acct.last_error_at = None;
            acct.last_success_at = Some(now);
            acct.connection_status = Some("ok".to_string());
            acct.updated_at = now;
            return Ok(acct.clone());
        }

        let acct = EmailAccount {
            id: Uuid::new_v4(),
            client_id: connection.client_id,
            provider: connection.provider,
            email_address: connection.email_address,
            status: AccountStatus::Connected,
            access_token_enc: Some(connection.access_token_enc),
            refresh_token_enc: connection.refresh_token_enc,
            expires_at: connection.expires_at,
            scopes: connection.scopes,
            gmail_history_id: None,
            gmail_watch_expires_at: None,
            ms_subscription_id: None,
            ms_subscription_expires_at: None,
            last_error: None,
            last_error_at: None,
            last_success_at: Some(now),
            connection_status: Some("ok".to_string()),
            created_at: now,
            updated_at: now,
        };
        accounts.push(acct.clone());
        Ok(acct)
    }

    async fn update_tokens(&self, account_id: Uuid, tokens: TokenUpdate) -> Result<()> {
        self.modify(account_id, |a| {
            a.access_token_enc = Some(tokens.access_token_enc);
            if tokens.refresh_token_enc.is_some() {
                a.refresh_token_enc = tokens.refresh_token_enc;
            }
            a.expires_at = Some(tokens.expires_at);
            a.last_success_at = Some(Utc::now());
        })
    }

    async fn update_gmail_watch(
        &self,
        account_id: Uuid,
        history_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.modify(account_id, |a| {
            a.gmail_history_id = Some(history_id.to_string());
            a.gmail_watch_expires_at = expires_at;
            a.last_success_at = Some(Utc::now());
        })
    }

    async fn update_ms_subscription(
        &self,
        account_id: Uuid,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.modify(account_id, |a| {
            a.ms_subscription_id = Some(subscription_id.to_string());
            a.ms_subscription_expires_at = Some(expires_at);
            a.last_success_at = Some(Utc::now());
        })
    }

    async fn mark_status(&self, account_id: Uuid, update: StatusUpdate) -> Result<()> {
        self.modify(account_id, |a| {
            a.status = update.status;
            if let Some(err) = update.last_error {
                a.last_error_at = err.as_ref().map(|_| Utc::now());
                a.last_error = err;
            }
            if let Some(status) = update.connection_status {
                a.connection_status = Some(status.as_str().to_string());
            }
        })
    }

    async fn touch_success(&self, account_id: Uuid) -> Result<()> {
        self.modify(account_id, |a| a.last_success_at = Some(Utc::now()))
    }

    async fn disconnect(&self, client_id: Uuid, provider: Provider) -> Result<bool> {
        let id = self
            .select(|a| a.client_id == client_id && a.provider == provider)
            .pop()
            .map(|a| a.id);
        let Some(id) = id else {
            return Ok(false);
        };
        self.modify(id, |a| {
            a.status = AccountStatus::Disconnected;
            a.access_token_enc = None;
            a.refresh_token_enc = None;
            a.expires_at = None;
            a.scopes = None;
            a.gmail_history_id = None;
            a.gmail_watch_expires_at = None;
            a.ms_subscription_id = None;
            a.ms_subscription_expires_at = None;
            a.last_error = None;
            a.last_error_at = None;
            a.connection_status = Some("inactive".to_string());
        })?;
        Ok(true)
    }
}

/// Scripted Gmail: every account gets `history_id` unless listed in `failures`.
pub struct FakeGmail {
    pub history_id: String,
    pub expires_at: DateTime<Utc>,
    pub failures: HashMap<Uuid, String>,
    calls: AtomicUsize,
}

impl FakeGmail {
    pub fn returning(history_id: &str) -> Self {
        Self {
            history_id: history_id.to_string(),
            expires_at: Utc::now() + Duration::days(7),
            failures: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_for(mut self, account_id: Uuid, message: &str) -> Self {
        self.failures.insert(account_id, message.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GmailWatchApi for FakeGmail {
    async fn watch(&self, account: &EmailAccount) -> Result<WatchRegistration> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failures.get(&account.id) {
            bail!("{}", message);
        }
        Ok(WatchRegistration {
            history_id: Some(self.history_id.clone()),
            expires_at: Some(self.expires_at),
        })
    }
}

/// How [`FakeGraph`] answers for one account
#[derive(Debug, Clone)]
pub enum GraphBehavior {
    Extend,
    Recreate(String),
    Fail(String),
}

/// Scripted Graph; accounts not listed in `behaviors` are extended in place.
#[derive(Default)]
pub struct FakeGraph {
    pub behaviors: HashMap<Uuid, GraphBehavior>,
    subscribed: AtomicUsize,
}

impl FakeGraph {
    pub fn with(mut self, account_id: Uuid, behavior: GraphBehavior) -> Self {
        self.behaviors.insert(account_id, behavior);
        self
    }

    pub fn subscribed(&self) -> usize {
        self.subscribed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GraphSubscriptions for FakeGraph {
    async fn renew(&self, account: &EmailAccount) -> Result<SubscriptionState> {
        let expires_at = Utc::now() + Duration::days(2);
        match self.behaviors.get(&account.id) {
            Some(GraphBehavior::Fail(message)) => bail!("{}", message),
            Some(GraphBehavior::Recreate(new_id)) => Ok(SubscriptionState {
                id: new_id.clone(),
                expires_at,
            }),
            Some(GraphBehavior::Extend) | None => Ok(SubscriptionState {
                id: account
                    .ms_subscription_id
                    .clone()
                    .ok_or_else(|| anyhow!("no subscription to renew"))?,
                expires_at,
            }),
        }
    }

    async fn subscribe(&self, account: &EmailAccount) -> Result<SubscriptionState> {
        self.subscribed.fetch_add(1, Ordering::SeqCst);
        if let Some(GraphBehavior::Fail(message)) = self.behaviors.get(&account.id) {
            bail!("{}", message);
        }
        Ok(SubscriptionState {
            id: format!("sub-{}", account.id),
            expires_at: Utc::now() + Duration::days(2),
        })
    }
}

/// Scripted consent: every code yields `access_token` for `email_address`.
pub struct FakeOAuth {
    pub email_address: String,
    pub refresh_token: Option<String>,
}

impl FakeOAuth {
    pub fn issuing(email_address: &str, refresh_token: Option<&str>) -> Self {
        Self {
            email_address: email_address.to_string(),
            refresh_token: refresh_token.map(str::to_string),
        }
    }
}

#[async_trait]
impl OAuthExchange for FakeOAuth {
    async fn complete(&self, _client: &ProviderClient, code: &str) -> Result<ConnectedMailbox> {
        if code == "bad-code" {
            bail!("token exchange failed: 400 Bad Request {{\"error\":\"invalid_grant\"}}");
        }
        Ok(ConnectedMailbox {
            tokens: TokenResponse {
                access_token: format!("access-for-{}", code),
                refresh_token: self.refresh_token.clone(),
                expires_in: Some(3599),
                scope: None,
            },
            email_address: self.email_address.clone(),
        })
    }
}
