use anyhow::{Context, Result};
use std::env;

/// OAuth client registration for one provider
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub oauth: OAuthClientConfig,
    /// Pub/Sub topic Gmail publishes mailbox changes to
    pub pubsub_topic: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MicrosoftConfig {
    pub oauth: OAuthClientConfig,
    pub tenant_id: String,
    pub notification_url: Option<String>,
    pub client_state: Option<String>,
}

/// Session JWT settings. Tokens are minted by the hosted auth service.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub jwt_secret: String,
    pub audience: String,
    pub cookie_name: String,
}

/// Process configuration, loaded once in `main` and shared through `AppState`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub cors_allowed_origins: Option<String>,
    pub email_token_encryption_key: String,
    pub internal_jobs_token: Option<String>,
    pub session: SessionConfig,
    pub google: Option<GoogleConfig>,
    pub microsoft: Option<MicrosoftConfig>,
    pub app_base_url: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            cors_allowed_origins: optional_var("CORS_ALLOWED_ORIGINS"),
            email_token_encryption_key: env::var("EMAIL_TOKEN_ENCRYPTION_KEY")
                .context("EMAIL_TOKEN_ENCRYPTION_KEY must be set")?,
            internal_jobs_token: optional_var("INTERNAL_JOBS_TOKEN"),
            session: SessionConfig {
                jwt_secret: env::var("SUPABASE_JWT_SECRET")
                    .context("SUPABASE_JWT_SECRET must be set")?,
                audience: optional_var("SUPABASE_JWT_AUDIENCE")
                    .unwrap_or_else(|| "authenticated".to_string()),
                cookie_name: "sb-access-token".to_string(),
            },
            google: google_from_env(),
            microsoft: microsoft_from_env(),
            app_base_url: optional_var("APP_BASE_URL").unwrap_or_else(|| "/".to_string()),
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn oauth_client_from_env(prefix: &str) -> Option<OAuthClientConfig> {
    Some(OAuthClientConfig {
        client_id: optional_var(&format!("{}_CLIENT_ID", prefix))?,
        client_secret: optional_var(&format!("{}_CLIENT_SECRET", prefix))?,
        redirect_uri: optional_var(&format!("{}_REDIRECT_URI", prefix))?,
    })
}

fn google_from_env() -> Option<GoogleConfig> {
    let oauth = oauth_client_from_env("GOOGLE");
    if oauth.is_none() {
        tracing::warn!("Google OAuth is not configured; Gmail connections are disabled");
    }
    Some(GoogleConfig {
        oauth: oauth?,
        pubsub_topic: optional_var("GMAIL_PUBSUB_TOPIC"),
    })
}

fn microsoft_from_env() -> Option<MicrosoftConfig> {
    let oauth = oauth_client_from_env("MICROSOFT");
    if oauth.is_none() {
        tracing::warn!("Microsoft OAuth is not configured; Outlook connections are disabled");
    }
    Some(MicrosoftConfig {
        oauth: oauth?,
        tenant_id: optional_var("MICROSOFT_TENANT_ID").unwrap_or_else(|| "common".to_string()),
        notification_url: optional_var("MS_NOTIFICATION_URL"),
        client_state: optional_var("MS_CLIENT_STATE"),
    })
}

#[cfg(test)]
impl AppConfig {
    /// Config with every provider configured, for handler tests.
    pub fn for_tests() -> Self {
        Self {
            database_url: "postgres://localhost/test".to_string(),
            port: 0,
            cors_allowed_origins: None,
            email_token_encryption_key: crate::test_support::TEST_KEY_B64.to_string(),
            internal_jobs_token: Some("internal-secret".to_string()),
            session: SessionConfig {
                jwt_secret: "test-secret-key-for-testing-only".to_string(),
                audience: "authenticated".to_string(),
                cookie_name: "sb-access-token".to_string(),
            },
            google: Some(GoogleConfig {
                oauth: OAuthClientConfig {
                    client_id: "google-client".to_string(),
                    client_secret: "google-secret".to_string(),
                    redirect_uri: "http://localhost/api/email/oauth/google/callback".to_string(),
                },
                pubsub_topic: Some("projects/billybot/topics/gmail".to_string()),
            }),
            microsoft: Some(MicrosoftConfig {
                oauth: OAuthClientConfig {
                    client_id: "ms-client".to_string(),
                    client_secret: "ms-secret".to_string(),
                    redirect_uri: "http://localhost/api/email/oauth/microsoft/callback"
                        .to_string(),
                },
                tenant_id: "common".to_string(),
                notification_url: Some(
                    "https://billybot.example/api/email/microsoft/notifications".to_string(),
                ),
                client_state: Some("client-state-secret".to_string()),
            }),
            app_base_url: "/settings/email".to_string(),
        }
    }
}
