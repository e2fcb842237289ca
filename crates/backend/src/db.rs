use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager, ManagerConfig},
    AsyncPgConnection, RunQueryDsl,
};
use shared_types::{AccountStatus, ConnectionStatus, EmailAccount, Provider};
use uuid::Uuid;

use crate::models::{
    EmailAccountRow, NewEmailAccountRow, ReconnectChangeset, StatusChangeset, TokenChangeset,
};

pub type DbPool = Pool<AsyncPgConnection>;

async fn establish_tls_connection(config: String) -> diesel::ConnectionResult<AsyncPgConnection> {
    // Set up rustls TLS configuration
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

    // Parse the connection string and connect with TLS
    let (client, connection) = tokio_postgres::connect(&config, tls)
        .await
        .map_err(|e| diesel::ConnectionError::BadConnection(e.to_string()))?;

    // Spawn the connection task
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection error: {}", e);
        }
    });

    AsyncPgConnection::try_from(client).await
}

pub fn establish_connection_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let mut manager_config = ManagerConfig::default();
    manager_config.custom_setup =
        Box::new(|url| Box::pin(establish_tls_connection(url.to_string())));

    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new_with_config(
        database_url,
        manager_config,
    );
    let pool = Pool::builder(config).max_size(10).build()?;

    Ok(pool)
}

// Email account database operations
pub mod email_accounts {
    use super::*;
    use crate::schema::email_accounts::dsl::*;

    fn into_accounts(rows: Vec<EmailAccountRow>) -> anyhow::Result<Vec<EmailAccount>> {
        rows.into_iter().map(EmailAccount::try_from).collect()
    }

    pub async fn list_by_client(
        conn: &mut AsyncPgConnection,
        client: Uuid,
    ) -> anyhow::Result<Vec<EmailAccount>> {
        let rows = email_accounts
            .filter(client_id.eq(client))
            .order_by(provider.asc())
            .select(EmailAccountRow::as_select())
            .load(conn)
            .await?;

        into_accounts(rows)
    }

    pub async fn get_by_ms_subscription(
        conn: &mut AsyncPgConnection,
        subscription: &str,
    ) -> anyhow::Result<Option<EmailAccount>> {
        let row = email_accounts
            .filter(ms_subscription_id.eq(subscription))
            .select(EmailAccountRow::as_select())
            .first(conn)
            .await
            .optional()?;

        row.map(EmailAccount::try_from).transpose()
    }

    /// Microsoft accounts holding a subscription that lapses at or before `before`.
    pub async fn list_ms_subscriptions_due(
        conn: &mut AsyncPgConnection,
        before: DateTime<Utc>,
    ) -> anyhow::Result<Vec<EmailAccount>> {
        let rows = email_accounts
            .filter(provider.eq(Provider::Microsoft.as_str()))
            .filter(ms_subscription_id.is_not_null())
            .filter(ms_subscription_expires_at.le(before))
            .order_by(ms_subscription_expires_at.asc())
            .select(EmailAccountRow::as_select())
            .load(conn)
            .await?;

        into_accounts(rows)
    }

    /// Connected Google accounts with no watch or one lapsing at or before `before`.
    pub async fn list_gmail_watches_due(
        conn: &mut AsyncPgConnection,
        before: DateTime<Utc>,
    ) -> anyhow::Result<Vec<EmailAccount>> {
        let rows = email_accounts
            .filter(provider.eq(Provider::Google.as_str()))
            .filter(status.eq(AccountStatus::Connected.as_str()))
            .filter(
                gmail_watch_expires_at
                    .is_null()
                    .or(gmail_watch_expires_at.le(before)),
            )
            .select(EmailAccountRow::as_select())
            .load(conn)
            .await?;

        into_accounts(rows)
    }

    pub async fn upsert_connected(
        conn: &mut AsyncPgConnection,
        new_row: NewEmailAccountRow,
    ) -> anyhow::Result<EmailAccount> {
        let now = Utc::now();
        let changes = ReconnectChangeset {
            email_address: new_row.email_address.clone(),
            status: AccountStatus::Connected.as_str().to_string(),
            access_token_enc: new_row.access_token_enc.clone(),
            refresh_token_enc: new_row.refresh_token_enc.clone(),
            expires_at: new_row.expires_at,
            scopes: new_row.scopes.clone(),
            last_error: Some(None),
            last_error_at: Some(None),
            last_success_at: Some(now),
            connection_status: Some(Some(ConnectionStatus::Ok.as_str().to_string())),
            updated_at: now,
        };

        let row = diesel::insert_into(email_accounts)
            .values(&new_row)
            .on_conflict((client_id, provider))
            .do_update()
            .set(&changes)
            .returning(EmailAccountRow::as_returning())
            .get_result(conn)
            .await?;

        row.try_into()
    }

    pub async fn update_tokens(
        conn: &mut AsyncPgConnection,
        account_id: Uuid,
        changes: TokenChangeset,
    ) -> anyhow::Result<()> {
        diesel::update(email_accounts.filter(id.eq(account_id)))
            .set(&changes)
            .execute(conn)
            .await?;

        Ok(())
    }

    pub async fn update_gmail_watch(
        conn: &mut AsyncPgConnection,
        account_id: Uuid,
        history: &str,
        watch_expires: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        diesel::update(email_accounts.filter(id.eq(account_id)))
            .set((
                gmail_history_id.eq(Some(history)),
                gmail_watch_expires_at.eq(watch_expires),
                last_success_at.eq(Some(now)),
                updated_at.eq(now),
            ))
            .execute(conn)
            .await?;

        Ok(())
    }

    pub async fn update_ms_subscription(
        conn: &mut AsyncPgConnection,
        account_id: Uuid,
        subscription: &str,
        subscription_expires: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        diesel::update(email_accounts.filter(id.eq(account_id)))
            .set((
                ms_subscription_id.eq(Some(subscription)),
                ms_subscription_expires_at.eq(Some(subscription_expires)),
                last_success_at.eq(Some(now)),
                updated_at.eq(now),
            ))
            .execute(conn)
            .await?;

        Ok(())
    }

    pub async fn update_status(
        conn: &mut AsyncPgConnection,
        account_id: Uuid,
        changes: StatusChangeset,
    ) -> anyhow::Result<()> {
        diesel::update(email_accounts.filter(id.eq(account_id)))
            .set(&changes)
            .execute(conn)
            .await?;

        Ok(())
    }

    pub async fn touch_success(
        conn: &mut AsyncPgConnection,
        account_id: Uuid,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        diesel::update(email_accounts.filter(id.eq(account_id)))
            .set((last_success_at.eq(Some(now)), updated_at.eq(now)))
            .execute(conn)
            .await?;

        Ok(())
    }

    /// Soft-disconnect: every token and watch column is wiped in one statement.
    pub async fn disconnect(
        conn: &mut AsyncPgConnection,
        client: Uuid,
        provider_val: Provider,
    ) -> anyhow::Result<bool> {
        let updated = diesel::update(
            email_accounts
                .filter(client_id.eq(client))
                .filter(provider.eq(provider_val.as_str())),
        )
        .set((
            status.eq(AccountStatus::Disconnected.as_str()),
            access_token_enc.eq(None::<String>),
            refresh_token_enc.eq(None::<String>),
            expires_at.eq(None::<DateTime<Utc>>),
            scopes.eq(None::<String>),
            gmail_history_id.eq(None::<String>),
            gmail_watch_expires_at.eq(None::<DateTime<Utc>>),
            ms_subscription_id.eq(None::<String>),
            ms_subscription_expires_at.eq(None::<DateTime<Utc>>),
            last_error.eq(None::<String>),
            last_error_at.eq(None::<DateTime<Utc>>),
            connection_status.eq(Some(ConnectionStatus::Inactive.as_str())),
            updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;

        Ok(updated > 0)
    }
}
