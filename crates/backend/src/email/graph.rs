//! Microsoft Graph change-notification subscriptions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use shared_types::EmailAccount;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::tokens::TokenBroker;
use crate::config::MicrosoftConfig;

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Graph caps Outlook message subscriptions just under three days.
pub const SUBSCRIPTION_LIFETIME_MINUTES: i64 = 4230;

const INBOX_RESOURCE: &str = "me/mailFolders('Inbox')/messages";

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Graph API error {status}: {body}")]
    ApiError { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSubscription {
    pub id: String,
    pub expiration_date_time: DateTime<Utc>,
    pub resource: Option<String>,
    pub client_state: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubscription<'a> {
    change_type: &'a str,
    notification_url: &'a str,
    resource: &'a str,
    expiration_date_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_state: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtendSubscription {
    expiration_date_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphUser {
    pub mail: Option<String>,
    pub user_principal_name: Option<String>,
}

/// Body Graph POSTs to the notification URL
#[derive(Debug, Clone, Deserialize)]
pub struct GraphNotificationBatch {
    #[serde(default)]
    pub value: Vec<GraphNotification>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNotification {
    pub subscription_id: String,
    pub client_state: Option<String>,
    pub change_type: Option<String>,
    pub resource: Option<String>,
}

pub struct GraphClient {
    client: reqwest::Client,
    access_token: String,
}

impl GraphClient {
    pub fn new(client: reqwest::Client, access_token: String) -> Self {
        Self {
            client,
            access_token,
        }
    }

    /// Signed-in user's profile
    pub async fn me(&self) -> GraphResult<GraphUser> {
        let url = format!("{}/me?$select=mail,userPrincipalName", GRAPH_BASE);
        debug!("Graph: fetching profile");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        parse_response(response).await
    }

    /// Push the expiry of an existing subscription out to `expires_at`
    pub async fn extend_subscription(
        &self,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> GraphResult<GraphSubscription> {
        let url = format!("{}/subscriptions/{}", GRAPH_BASE, subscription_id);
        debug!("Graph: extending subscription {}", subscription_id);

        let response = self
            .client
            .patch(&url)
            .bearer_auth(&self.access_token)
            .json(&ExtendSubscription {
                expiration_date_time: expires_at,
            })
            .send()
            .await?;

        parse_response(response).await
    }

    /// Subscribe to new messages in the inbox
    pub async fn create_subscription(
        &self,
        notification_url: &str,
        client_state: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> GraphResult<GraphSubscription> {
        let url = format!("{}/subscriptions", GRAPH_BASE);
        debug!("Graph: creating inbox subscription");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&CreateSubscription {
                change_type: "created",
                notification_url,
                resource: INBOX_RESOURCE,
                expiration_date_time: expires_at,
                client_state,
            })
            .send()
            .await?;

        let subscription: GraphSubscription = parse_response(response).await?;
        info!("Graph: created subscription {}", subscription.id);
        Ok(subscription)
    }
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> GraphResult<T> {
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(GraphError::ApiError { status, body });
    }

    response
        .json()
        .await
        .map_err(|e| GraphError::ParseError(e.to_string()))
}

/// Subscription id and expiry after a successful renew or create
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionState {
    pub id: String,
    pub expires_at: DateTime<Utc>,
}

impl From<GraphSubscription> for SubscriptionState {
    fn from(sub: GraphSubscription) -> Self {
        Self {
            id: sub.id,
            expires_at: sub.expiration_date_time,
        }
    }
}

#[async_trait]
pub trait GraphSubscriptions: Send + Sync {
    /// Extend the account's subscription, or replace it when Graph rejects
    /// the extension. A changed `id` in the result means it was replaced.
    async fn renew(&self, account: &EmailAccount) -> Result<SubscriptionState>;

    /// Create a subscription for an account that has none.
    async fn subscribe(&self, account: &EmailAccount) -> Result<SubscriptionState>;
}

/// Production [`GraphSubscriptions`] backed by the Graph REST API
pub struct GraphSubscriptionManager {
    http: reqwest::Client,
    tokens: Arc<TokenBroker>,
    microsoft: Option<MicrosoftConfig>,
}

impl GraphSubscriptionManager {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<TokenBroker>,
        microsoft: Option<MicrosoftConfig>,
    ) -> Self {
        Self {
            http,
            tokens,
            microsoft,
        }
    }

    async fn client_for(&self, account: &EmailAccount) -> Result<GraphClient> {
        let access_token = self.tokens.access_token(account).await?;
        Ok(GraphClient::new(self.http.clone(), access_token))
    }

    async fn create(&self, client: &GraphClient) -> Result<SubscriptionState> {
        let microsoft = self
            .microsoft
            .as_ref()
            .context("Microsoft OAuth is not configured")?;
        let notification_url = microsoft
            .notification_url
            .as_deref()
            .context("MS_NOTIFICATION_URL is not configured")?;

        let subscription = client
            .create_subscription(
                notification_url,
                microsoft.client_state.as_deref(),
                next_expiry(),
            )
            .await?;
        Ok(subscription.into())
    }
}

fn next_expiry() -> DateTime<Utc> {
    Utc::now() + Duration::minutes(SUBSCRIPTION_LIFETIME_MINUTES)
}

#[async_trait]
impl GraphSubscriptions for GraphSubscriptionManager {
    async fn renew(&self, account: &EmailAccount) -> Result<SubscriptionState> {
        let subscription_id = account
            .ms_subscription_id
            .as_deref()
            .context("account has no Graph subscription")?;
        let client = self.client_for(account).await?;

        match client
            .extend_subscription(subscription_id, next_expiry())
            .await
        {
            Ok(subscription) => Ok(subscription.into()),
            Err(GraphError::ApiError { status, body }) => {
                warn!(
                    "Graph rejected renewal of {} for account {} ({}: {}), creating a new subscription",
                    subscription_id, account.id, status, body
                );
                self.create(&client).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn subscribe(&self, account: &EmailAccount) -> Result<SubscriptionState> {
        let client = self.client_for(account).await?;
        self.create(&client).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_subscription_parses_graph_payload() {
        let json = r#"{
            "@odata.context": "https://graph.microsoft.com/v1.0/$metadata#subscriptions/$entity",
            "id": "7f105c7d-2dc5-4530-97cd-4e7ae6534c07",
            "resource": "me/mailFolders('Inbox')/messages",
            "changeType": "created",
            "clientState": "secret",
            "notificationUrl": "https://billybot.example/api/email/microsoft/notifications",
            "expirationDateTime": "2025-03-04T10:30:00.0000000Z"
        }"#;

        let sub: GraphSubscription = serde_json::from_str(json).unwrap();
        assert_eq!(sub.id, "7f105c7d-2dc5-4530-97cd-4e7ae6534c07");
        assert_eq!(
            sub.expiration_date_time,
            Utc.with_ymd_and_hms(2025, 3, 4, 10, 30, 0).unwrap()
        );

        let state = SubscriptionState::from(sub);
        assert_eq!(state.id, "7f105c7d-2dc5-4530-97cd-4e7ae6534c07");
    }

    #[test]
    fn test_create_body_uses_graph_field_names() {
        let body = CreateSubscription {
            change_type: "created",
            notification_url: "https://example.com/hook",
            resource: INBOX_RESOURCE,
            expiration_date_time: Utc.with_ymd_and_hms(2025, 3, 4, 10, 30, 0).unwrap(),
            client_state: None,
        };
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["changeType"], "created");
        assert_eq!(json["notificationUrl"], "https://example.com/hook");
        assert_eq!(json["resource"], INBOX_RESOURCE);
        assert!(json["expirationDateTime"]
            .as_str()
            .unwrap()
            .starts_with("2025-03-04T10:30:00"));
        assert!(json.get("clientState").is_none());
    }

    #[test]
    fn test_notification_batch_parses() {
        let json = r#"{"value":[{
            "subscriptionId": "sub-1",
            "clientState": "client-state-secret",
            "changeType": "created",
            "resource": "Users/abc/Messages/xyz",
            "tenantId": "t"
        }]}"#;

        let batch: GraphNotificationBatch = serde_json::from_str(json).unwrap();
        assert_eq!(batch.value.len(), 1);
        assert_eq!(batch.value[0].subscription_id, "sub-1");
        assert_eq!(
            batch.value[0].client_state.as_deref(),
            Some("client-state-secret")
        );
    }

    #[test]
    fn test_api_error_display_carries_body() {
        let err = GraphError::ApiError {
            status: 404,
            body: "ResourceNotFound".to_string(),
        };
        assert_eq!(err.to_string(), "Graph API error 404: ResourceNotFound");
    }
}
