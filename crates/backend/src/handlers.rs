use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use shared_types::{
    DisconnectRequest, EmailAccount, EmailAccountResponse, GoogleWatchRefreshResponse,
    GoogleWatchResponse, ListEmailAccountsResponse, MicrosoftRenewalResponse,
    OAuthStartResponse, OkResponse, Provider,
};
use std::collections::BTreeSet;

use crate::auth::{extract_auth_user, jwt, require_internal_token};
use crate::email::graph::GraphNotificationBatch;
use crate::email::{oauth, renewal, status, watch};
use crate::error::{ApiError, ApiResult};
use crate::repository::NewConnection;
use crate::AppState;

pub async fn health_check() -> StatusCode {
    StatusCode::OK
}

fn account_response(account: EmailAccount) -> EmailAccountResponse {
    let connection_status = status::classify(&account);
    EmailAccountResponse {
        id: account.id,
        provider: account.provider,
        email_address: account.email_address,
        status: account.status,
        connection_status,
        scopes: account.scopes,
        expires_at: account.expires_at,
        gmail_watch_expires_at: account.gmail_watch_expires_at,
        ms_subscription_expires_at: account.ms_subscription_expires_at,
        last_error: account.last_error,
        last_error_at: account.last_error_at,
        last_success_at: account.last_success_at,
    }
}

// Email account handlers
pub async fn list_email_accounts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ListEmailAccountsResponse>> {
    let user = extract_auth_user(&headers, &state.config.session)?;
    let accounts = state.store.list_for_client(user.client_id).await?;

    Ok(Json(ListEmailAccountsResponse {
        ok: true,
        accounts: accounts.into_iter().map(account_response).collect(),
    }))
}

pub async fn disconnect_email_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DisconnectRequest>,
) -> ApiResult<Json<OkResponse>> {
    let user = extract_auth_user(&headers, &state.config.session)?;

    if state
        .store
        .disconnect(user.client_id, request.provider)
        .await?
    {
        tracing::info!(
            "Disconnected {} account for client {}",
            request.provider,
            user.client_id
        );
    } else {
        tracing::debug!(
            "No {} account to disconnect for client {}",
            request.provider,
            user.client_id
        );
    }

    Ok(Json(OkResponse { ok: true }))
}

// Scheduled jobs
pub async fn renew_microsoft_subscriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<MicrosoftRenewalResponse>> {
    require_internal_token(&headers, &state.config)?;

    let report =
        renewal::renew_due_subscriptions(state.store.as_ref(), state.graph.as_ref(), Utc::now())
            .await?;

    Ok(Json(MicrosoftRenewalResponse {
        ok: true,
        summary: report.summary,
        results: report.results,
    }))
}

pub async fn register_google_watches(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<GoogleWatchResponse>> {
    require_internal_token(&headers, &state.config)?;
    let user = extract_auth_user(&headers, &state.config.session)?;

    let updated =
        watch::register_client_watches(state.store.as_ref(), state.gmail.as_ref(), user.client_id)
            .await?;

    Ok(Json(GoogleWatchResponse { ok: true, updated }))
}

pub async fn refresh_google_watches(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<GoogleWatchRefreshResponse>> {
    require_internal_token(&headers, &state.config)?;

    let report =
        watch::refresh_expiring_watches(state.store.as_ref(), state.gmail.as_ref(), Utc::now())
            .await?;

    Ok(Json(GoogleWatchRefreshResponse {
        ok: true,
        total: report.total,
        failed: report.failed,
        updated: report.updated,
    }))
}

// OAuth connect flow - Step 1: hand the browser a consent URL
pub async fn start_oauth(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(provider): Path<Provider>,
) -> ApiResult<Json<OAuthStartResponse>> {
    let user = extract_auth_user(&headers, &state.config.session)?;
    let client = oauth::provider_client(&state.config, provider)?;
    tracing::info!(
        "Starting {} connect for client {} ({})",
        provider,
        user.client_id,
        user.email.as_deref().unwrap_or("no email claim")
    );

    let state_token = jwt::create_state_token(&state.config.session, user.client_id, provider)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("Failed to create state token: {}", e)))?;

    Ok(Json(OAuthStartResponse {
        auth_url: client.authorization_url(&state_token),
    }))
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

// OAuth connect flow - Step 2: provider redirects back here
pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<Provider>,
    Query(params): Query<OAuthCallbackParams>,
) -> Response {
    let base = &state.config.app_base_url;

    if let Some(error) = params.error.as_deref() {
        tracing::warn!("{} OAuth consent was not granted: {}", provider, error);
        return Redirect::to(&app_redirect(base, "email_error", error)).into_response();
    }

    match handle_callback_inner(&state, provider, params).await {
        Ok(()) => Redirect::to(&app_redirect(base, "email_connected", provider.as_str()))
            .into_response(),
        Err(e) => {
            tracing::error!("{} OAuth callback error: {:?}", provider, e);
            Redirect::to(&app_redirect(base, "email_error", "connect_failed")).into_response()
        }
    }
}

async fn handle_callback_inner(
    state: &AppState,
    provider: Provider,
    params: OAuthCallbackParams,
) -> Result<(), ApiError> {
    let code = params
        .code
        .ok_or_else(|| ApiError::bad_request("Missing authorization code"))?;
    let state_token = params
        .state
        .ok_or_else(|| ApiError::bad_request("Missing OAuth state"))?;

    let claims = jwt::validate_state_token(&state.config.session, &state_token)
        .map_err(|_| ApiError::Unauthorized("Invalid or expired OAuth state".to_string()))?;
    if claims.provider != provider {
        return Err(ApiError::bad_request("OAuth state was issued for another provider"));
    }

    let client = oauth::provider_client(&state.config, provider)?;
    let oauth::ConnectedMailbox {
        tokens,
        email_address,
    } = state.oauth.complete(&client, &code).await?;

    if tokens.refresh_token.is_none() {
        tracing::warn!(
            "No refresh token received for {} - keeping any previously stored one",
            email_address
        );
    }

    let connection = NewConnection {
        client_id: claims.sub,
        provider,
        email_address,
        access_token_enc: state.cipher.encrypt(&tokens.access_token)?,
        refresh_token_enc: tokens
            .refresh_token
            .as_deref()
            .map(|t| state.cipher.encrypt(t))
            .transpose()?,
        expires_at: Some(tokens.expires_at(Utc::now())),
        scopes: tokens.scope.clone().or_else(|| Some(client.scopes.to_string())),
    };
    let account = state.store.upsert_connected(connection).await?;

    tracing::info!(
        "Connected {} account {} for client {}",
        provider,
        account.email_address,
        account.client_id
    );

    // Push channel setup is best-effort; failures are recorded on the account
    match provider {
        Provider::Google => {
            watch::register_watch(state.store.as_ref(), state.gmail.as_ref(), &account).await;
        }
        Provider::Microsoft => {
            renewal::ensure_subscription(state.store.as_ref(), state.graph.as_ref(), &account)
                .await;
        }
    }

    Ok(())
}

fn app_redirect(base: &str, key: &str, value: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}{}={}", base, separator, key, urlencoding::encode(value))
}

#[derive(Debug, Deserialize)]
pub struct NotificationParams {
    #[serde(rename = "validationToken")]
    pub validation_token: Option<String>,
}

/// Graph change notifications and the subscription validation handshake.
pub async fn microsoft_notifications(
    State(state): State<AppState>,
    Query(params): Query<NotificationParams>,
    body: Bytes,
) -> ApiResult<Response> {
    if let Some(token) = params.validation_token {
        return Ok((StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], token).into_response());
    }

    let batch: GraphNotificationBatch = serde_json::from_slice(&body)?;
    let Some(expected_state) = state
        .config
        .microsoft
        .as_ref()
        .and_then(|ms| ms.client_state.as_deref())
    else {
        tracing::warn!(
            "MS_CLIENT_STATE is not configured; dropping {} Graph notifications",
            batch.value.len()
        );
        return Ok(StatusCode::ACCEPTED.into_response());
    };

    let mut subscriptions = BTreeSet::new();
    for notification in batch.value {
        if notification.client_state.as_deref() != Some(expected_state) {
            tracing::warn!(
                "Dropping Graph notification for {} with mismatched clientState",
                notification.subscription_id
            );
            continue;
        }
        subscriptions.insert(notification.subscription_id);
    }

    for subscription_id in subscriptions {
        match state.store.find_by_ms_subscription(&subscription_id).await {
            Ok(Some(account)) => {
                if let Err(e) = state.store.touch_success(account.id).await {
                    tracing::error!("Failed to touch email account {}: {:#}", account.id, e);
                }
            }
            Ok(None) => {
                tracing::warn!("Graph notification for unknown subscription {}", subscription_id)
            }
            Err(e) => tracing::error!("Failed to look up subscription {}: {:#}", subscription_id, e),
        }
    }

    Ok(StatusCode::ACCEPTED.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::repository::AccountStore;
    use crate::test_support::{
        account, ms_account, test_cipher, FakeGmail, FakeGraph, FakeOAuth, GraphBehavior,
        InMemoryStore,
    };
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn test_state(store: Arc<InMemoryStore>, graph: FakeGraph) -> AppState {
        AppState {
            config: Arc::new(AppConfig::for_tests()),
            store,
            cipher: Arc::new(test_cipher()),
            gmail: Arc::new(FakeGmail::returning("4242")),
            graph: Arc::new(graph),
            oauth: Arc::new(FakeOAuth::issuing("owner@example.com", Some("fresh-refresh"))),
        }
    }

    fn callback_request(provider: Provider, client_id: Uuid, code: &str) -> Request<Body> {
        let config = AppConfig::for_tests();
        let state = jwt::create_state_token(&config.session, client_id, provider).unwrap();
        Request::get(format!(
            "/api/email/oauth/{}/callback?code={}&state={}",
            provider, code, state
        ))
        .body(Body::empty())
        .unwrap()
    }

    async fn redirect_location(state: AppState, request: Request<Body>) -> String {
        let response = crate::app(state).oneshot(request).await.unwrap();
        assert!(response.status().is_redirection());
        response.headers()[header::LOCATION]
            .to_str()
            .unwrap()
            .to_string()
    }

    fn session_cookie(client_id: Uuid) -> String {
        let config = AppConfig::for_tests();
        format!(
            "sb-access-token={}",
            jwt::create_session_token(&config.session, client_id)
        )
    }

    async fn send(state: AppState, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = crate::app(state).oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    fn json(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state(Arc::new(InMemoryStore::default()), FakeGraph::default());
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, _) = send(state, request).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_requires_session() {
        let state = test_state(Arc::new(InMemoryStore::default()), FakeGraph::default());
        let request = Request::get("/api/email/accounts").body(Body::empty()).unwrap();
        let (status, _) = send(state, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_list_never_exposes_token_ciphertext() {
        let mut acct = account(Provider::Google);
        acct.last_error = Some("invalid_grant".to_string());
        let ciphertext = acct.refresh_token_enc.clone().unwrap();
        let store = Arc::new(InMemoryStore::with_accounts(vec![
            acct.clone(),
            account(Provider::Microsoft),
        ]));

        let request = Request::get("/api/email/accounts")
            .header(header::COOKIE, session_cookie(acct.client_id))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(test_state(store, FakeGraph::default()), request).await;

        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body.clone()).unwrap();
        assert!(!text.contains(&ciphertext));
        assert!(!text.contains("token_enc"));

        let body = json(&body);
        assert_eq!(body["ok"], true);
        let accounts = body["accounts"].as_array().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0]["connection_status"], "provider_revoked");
        assert_eq!(accounts[0]["provider"], "google");
    }

    #[tokio::test]
    async fn test_disconnect_wipes_credentials() {
        let mut acct = ms_account("sub-1", Duration::days(1));
        acct.last_error = Some("AADSTS50076".to_string());
        let store = Arc::new(InMemoryStore::with_accounts(vec![acct.clone()]));

        let request = Request::post("/api/email/disconnect")
            .header(header::COOKIE, session_cookie(acct.client_id))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"provider":"microsoft"}"#))
            .unwrap();
        let (status, body) = send(test_state(store.clone(), FakeGraph::default()), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["ok"], true);

        let stored = store.account(acct.id);
        assert_eq!(stored.status, shared_types::AccountStatus::Disconnected);
        assert_eq!(stored.access_token_enc, None);
        assert_eq!(stored.refresh_token_enc, None);
        assert_eq!(stored.ms_subscription_id, None);
        assert_eq!(stored.ms_subscription_expires_at, None);
        assert_eq!(stored.last_error, None);
        assert_eq!(status::classify(&stored), shared_types::ConnectionStatus::Inactive);
    }

    #[tokio::test]
    async fn test_renewal_rejects_missing_or_wrong_internal_token() {
        let acct = ms_account("sub-1", Duration::hours(1));
        let store = Arc::new(InMemoryStore::with_accounts(vec![acct]));

        for token in [None, Some("wrong")] {
            let mut request = Request::post("/api/internal/email/microsoft/renew");
            if let Some(token) = token {
                request = request.header("x-internal-token", token);
            }
            let (status, _) = send(
                test_state(store.clone(), FakeGraph::default()),
                request.body(Body::empty()).unwrap(),
            )
            .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_renewal_without_configured_token_is_server_error() {
        let store = Arc::new(InMemoryStore::default());
        let mut state = test_state(store, FakeGraph::default());
        let mut config = AppConfig::for_tests();
        config.internal_jobs_token = None;
        state.config = Arc::new(config);

        let request = Request::post("/api/internal/email/microsoft/renew")
            .header("x-internal-token", "internal-secret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(state, request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_renewal_reports_summary_and_results() {
        let renewed = ms_account("sub-a", Duration::hours(2));
        let failing = ms_account("sub-b", Duration::hours(2));
        let store = Arc::new(InMemoryStore::with_accounts(vec![
            renewed.clone(),
            failing.clone(),
        ]));
        let graph = FakeGraph::default().with(
            failing.id,
            GraphBehavior::Fail("Graph API error 500: oops".to_string()),
        );

        let request = Request::post("/api/internal/email/microsoft/renew")
            .header("x-internal-token", "internal-secret")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(test_state(store, graph), request).await;

        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["ok"], true);
        assert_eq!(body["summary"]["total"], 2);
        assert_eq!(body["summary"]["renewed"], 1);
        assert_eq!(body["summary"]["failed"], 1);
        let results = body["results"].as_array().unwrap();
        assert!(results
            .iter()
            .any(|r| r["accountId"] == failing.id.to_string() && r["status"] == "error"));
    }

    #[tokio::test]
    async fn test_google_watch_needs_internal_token_and_session() {
        let acct = account(Provider::Google);
        let store = Arc::new(InMemoryStore::with_accounts(vec![acct.clone()]));

        let request = Request::post("/api/email/google/watch")
            .header("x-internal-token", "internal-secret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(test_state(store.clone(), FakeGraph::default()), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::post("/api/email/google/watch")
            .header(header::COOKIE, session_cookie(acct.client_id))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(test_state(store.clone(), FakeGraph::default()), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::post("/api/email/google/watch")
            .header("x-internal-token", "internal-secret")
            .header(header::COOKIE, session_cookie(acct.client_id))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(test_state(store.clone(), FakeGraph::default()), request).await;
        assert_eq!(status, StatusCode::OK);

        let body = json(&body);
        assert_eq!(body["updated"][0]["id"], acct.id.to_string());
        assert_eq!(body["updated"][0]["email_address"], acct.email_address);
        assert_eq!(body["updated"][0]["gmail_history_id"], "4242");
        assert_eq!(
            store.account(acct.id).gmail_history_id.as_deref(),
            Some("4242")
        );
    }

    #[tokio::test]
    async fn test_watch_refresh_reports_counts() {
        let acct = account(Provider::Google);
        let store = Arc::new(InMemoryStore::with_accounts(vec![acct]));

        let request = Request::post("/api/internal/email/google/watch-refresh")
            .header("x-internal-token", "internal-secret")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(test_state(store, FakeGraph::default()), request).await;

        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["total"], 1);
        assert_eq!(body["failed"], 0);
        assert_eq!(body["updated"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notification_validation_handshake_echoes_token() {
        let state = test_state(Arc::new(InMemoryStore::default()), FakeGraph::default());
        let request = Request::post("/api/email/microsoft/notifications?validationToken=abc%20123")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"abc 123");
    }

    #[tokio::test]
    async fn test_notifications_only_trust_matching_client_state() {
        let trusted = ms_account("sub-trusted", Duration::days(1));
        let spoofed = ms_account("sub-spoofed", Duration::days(1));
        let store = Arc::new(InMemoryStore::with_accounts(vec![
            trusted.clone(),
            spoofed.clone(),
        ]));

        let payload = serde_json::json!({"value": [
            {"subscriptionId": "sub-trusted", "clientState": "client-state-secret"},
            {"subscriptionId": "sub-spoofed", "clientState": "guess"},
            {"subscriptionId": "sub-unknown", "clientState": "client-state-secret"}
        ]});
        let request = Request::post("/api/email/microsoft/notifications")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap();
        let (status, _) = send(test_state(store.clone(), FakeGraph::default()), request).await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(store.account(trusted.id).last_success_at.is_some());
        assert_eq!(store.account(spoofed.id).last_success_at, None);
    }

    #[tokio::test]
    async fn test_oauth_start_returns_signed_state() {
        let client_id = Uuid::new_v4();
        let state = test_state(Arc::new(InMemoryStore::default()), FakeGraph::default());

        let request = Request::get("/api/email/oauth/microsoft/start")
            .header(header::COOKIE, session_cookie(client_id))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(state, request).await;

        assert_eq!(status, StatusCode::OK);
        let auth_url = json(&body)["auth_url"].as_str().unwrap().to_string();
        assert!(auth_url.starts_with("https://login.microsoftonline.com/common/oauth2/v2.0/authorize"));

        let state_param = auth_url
            .split('&')
            .find_map(|pair| pair.strip_prefix("state="))
            .unwrap();
        let claims =
            jwt::validate_state_token(&AppConfig::for_tests().session, state_param).unwrap();
        assert_eq!(claims.sub, client_id);
        assert_eq!(claims.provider, Provider::Microsoft);
    }

    #[tokio::test]
    async fn test_oauth_callback_with_bad_state_redirects_with_error() {
        let store = Arc::new(InMemoryStore::default());
        let request = Request::get("/api/email/oauth/google/callback?code=abc&state=forged")
            .body(Body::empty())
            .unwrap();

        let response = crate::app(test_state(store.clone(), FakeGraph::default()))
            .oneshot(request)
            .await
            .unwrap();

        assert!(response.status().is_redirection());
        assert_eq!(
            response.headers()[header::LOCATION],
            "/settings/email?email_error=connect_failed"
        );
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_oauth_callback_passes_through_consent_denial() {
        let request = Request::get("/api/email/oauth/microsoft/callback?error=access_denied")
            .body(Body::empty())
            .unwrap();

        let response = crate::app(test_state(
            Arc::new(InMemoryStore::default()),
            FakeGraph::default(),
        ))
        .oneshot(request)
        .await
        .unwrap();

        assert_eq!(
            response.headers()[header::LOCATION],
            "/settings/email?email_error=access_denied"
        );
    }

    #[tokio::test]
    async fn test_oauth_callback_connects_new_google_account() {
        let client_id = Uuid::new_v4();
        let store = Arc::new(InMemoryStore::default());
        let state = test_state(store.clone(), FakeGraph::default());

        let location =
            redirect_location(state, callback_request(Provider::Google, client_id, "c1")).await;
        assert_eq!(location, "/settings/email?email_connected=google");

        let accounts = store.list_for_client(client_id).await.unwrap();
        assert_eq!(accounts.len(), 1);
        let stored = &accounts[0];
        assert_eq!(stored.email_address, "owner@example.com");
        assert_eq!(stored.status, shared_types::AccountStatus::Connected);

        let cipher = test_cipher();
        let access = stored.access_token_enc.as_deref().unwrap();
        assert_eq!(cipher.decrypt(access).unwrap(), "access-for-c1");
        let refresh = stored.refresh_token_enc.as_deref().unwrap();
        assert_eq!(cipher.decrypt(refresh).unwrap(), "fresh-refresh");

        // Watch is registered right after connecting
        assert_eq!(stored.gmail_history_id.as_deref(), Some("4242"));
        assert_eq!(status::classify(stored), shared_types::ConnectionStatus::Ok);
    }

    #[tokio::test]
    async fn test_oauth_reconnect_updates_row_and_keeps_refresh_token() {
        let mut existing = ms_account("sub-old", Duration::days(2));
        existing.last_error = Some("AADSTS50076: MFA required".to_string());
        existing.connection_status = Some("needs_reconnect".to_string());
        let original_refresh = existing.refresh_token_enc.clone();
        let store = Arc::new(InMemoryStore::with_accounts(vec![existing.clone()]));

        let mut state = test_state(store.clone(), FakeGraph::default());
        state.oauth = Arc::new(FakeOAuth::issuing("owner@contoso.com", None));

        let location = redirect_location(
            state,
            callback_request(Provider::Microsoft, existing.client_id, "c2"),
        )
        .await;
        assert_eq!(location, "/settings/email?email_connected=microsoft");

        let accounts = store.list_for_client(existing.client_id).await.unwrap();
        assert_eq!(accounts.len(), 1);
        let stored = store.account(existing.id);
        assert_eq!(stored.email_address, "owner@contoso.com");
        assert_eq!(stored.refresh_token_enc, original_refresh);
        assert_eq!(stored.last_error, None);
        assert_eq!(stored.last_error_at, None);
        assert_eq!(stored.ms_subscription_id.as_deref(), Some("sub-old"));
        assert_eq!(status::classify(&stored), shared_types::ConnectionStatus::Ok);
    }

    #[tokio::test]
    async fn test_oauth_callback_survives_failed_push_setup() {
        let existing = account(Provider::Google);
        let store = Arc::new(InMemoryStore::with_accounts(vec![existing.clone()]));

        let mut state = test_state(store.clone(), FakeGraph::default());
        state.gmail = Arc::new(
            FakeGmail::returning("1").failing_for(existing.id, "Token has been expired or revoked."),
        );

        let location = redirect_location(
            state,
            callback_request(Provider::Google, existing.client_id, "c3"),
        )
        .await;
        assert_eq!(location, "/settings/email?email_connected=google");

        let stored = store.account(existing.id);
        assert_eq!(stored.status, shared_types::AccountStatus::Connected);
        assert!(stored.last_error.is_some());
        assert_eq!(stored.connection_status.as_deref(), Some("provider_revoked"));
        assert_eq!(stored.gmail_history_id, None);
    }

    #[tokio::test]
    async fn test_oauth_callback_subscribes_new_microsoft_account() {
        let client_id = Uuid::new_v4();
        let store = Arc::new(InMemoryStore::default());
        let state = test_state(store.clone(), FakeGraph::default());

        let location =
            redirect_location(state, callback_request(Provider::Microsoft, client_id, "c4")).await;
        assert_eq!(location, "/settings/email?email_connected=microsoft");

        let stored = store.list_for_client(client_id).await.unwrap().remove(0);
        assert_eq!(
            stored.ms_subscription_id,
            Some(format!("sub-{}", stored.id))
        );
    }

    #[tokio::test]
    async fn test_oauth_callback_with_failed_exchange_writes_nothing() {
        let client_id = Uuid::new_v4();
        let store = Arc::new(InMemoryStore::default());

        let location = redirect_location(
            test_state(store.clone(), FakeGraph::default()),
            callback_request(Provider::Google, client_id, "bad-code"),
        )
        .await;

        assert_eq!(location, "/settings/email?email_error=connect_failed");
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_oauth_callback_rejects_state_for_other_provider() {
        let store = Arc::new(InMemoryStore::default());
        let config = AppConfig::for_tests();
        let state_token =
            jwt::create_state_token(&config.session, Uuid::new_v4(), Provider::Google).unwrap();
        let request = Request::get(format!(
            "/api/email/oauth/microsoft/callback?code=c5&state={}",
            state_token
        ))
        .body(Body::empty())
        .unwrap();

        let location =
            redirect_location(test_state(store.clone(), FakeGraph::default()), request).await;
        assert_eq!(location, "/settings/email?email_error=connect_failed");
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_notifications_dropped_without_configured_client_state() {
        let acct = ms_account("sub-1", Duration::days(1));
        let store = Arc::new(InMemoryStore::with_accounts(vec![acct.clone()]));
        let mut config = AppConfig::for_tests();
        if let Some(ms) = config.microsoft.as_mut() {
            ms.client_state = None;
        }
        let mut state = test_state(store.clone(), FakeGraph::default());
        state.config = Arc::new(config);

        let payload = serde_json::json!({"value": [
            {"subscriptionId": "sub-1", "clientState": "anything"},
            {"subscriptionId": "sub-1"}
        ]});
        let request = Request::post("/api/email/microsoft/notifications")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap();
        let (status, _) = send(state, request).await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(store.account(acct.id).last_success_at, None);
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn test_app_redirect_appends_to_existing_query() {
        assert_eq!(
            app_redirect("/settings?tab=email", "email_connected", "google"),
            "/settings?tab=email&email_connected=google"
        );
    }
}
