use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use sheetsync_core::SyncError;
use tokio::sync::Mutex;
use tracing::debug;

use crate::sync_error_from_reqwest;

const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Supplies bearer tokens for the Sheets API.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, SyncError>;
}

/// A pre-issued token, e.g. from `gcloud auth print-access-token`.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, SyncError> {
        Ok(self.0.clone())
    }
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccountKey {
    /// Env-provided keys often carry literal `\n` sequences instead of newlines.
    pub fn normalized(mut self) -> Self {
        self.private_key = self.private_key.replace("\\n", "\n");
        self
    }

    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str::<Self>(text)
            .map(Self::normalized)
            .map_err(|err| SyncError::InvalidInput(format!("service account json: {err}")))
    }

    /// Resolution order: inline JSON, then email + private key, then a key file.
    pub fn from_sources(
        json: Option<&str>,
        client_email: Option<&str>,
        private_key: Option<&str>,
        project_id: Option<&str>,
        key_file: Option<&Path>,
    ) -> Result<Option<Self>, SyncError> {
        if let Some(json) = json.filter(|s| !s.trim().is_empty()) {
            return Self::from_json(json).map(Some);
        }
        if let (Some(email), Some(key)) = (client_email, private_key) {
            return Ok(Some(
                Self {
                    client_email: email.to_string(),
                    private_key: key.to_string(),
                    project_id: project_id.map(ToString::to_string),
                    token_uri: default_token_uri(),
                }
                .normalized(),
            ));
        }
        if let Some(path) = key_file {
            let text = std::fs::read_to_string(path).map_err(|err| {
                SyncError::InvalidInput(format!("reading {}: {err}", path.display()))
            })?;
            return Self::from_json(&text).map(Some);
        }
        Ok(None)
    }

    pub fn from_env() -> Result<Option<Self>, SyncError> {
        let var = |name: &str| std::env::var(name).ok();
        let key_file = var("GOOGLE_SERVICE_ACCOUNT_KEY_FILE").map(|p| {
            let path = PathBuf::from(p);
            if path.is_absolute() {
                path
            } else {
                std::env::current_dir().unwrap_or_default().join(path)
            }
        });
        Self::from_sources(
            var("GOOGLE_SERVICE_ACCOUNT_JSON").as_deref(),
            var("GOOGLE_SERVICE_ACCOUNT_CLIENT_EMAIL").as_deref(),
            var("GOOGLE_SERVICE_ACCOUNT_PRIVATE_KEY").as_deref(),
            var("GOOGLE_SERVICE_ACCOUNT_PROJECT_ID").as_deref(),
            key_file.as_deref(),
        )
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_after: DateTime<Utc>,
}

/// OAuth2 JWT-bearer exchange for a service account, cached until shortly before expiry.
pub struct ServiceAccountTokens {
    key: ServiceAccountKey,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountTokens {
    pub fn new(key: ServiceAccountKey, http: reqwest::Client) -> Self {
        Self {
            key,
            http,
            cached: Mutex::new(None),
        }
    }

    fn signed_assertion(&self, now: DateTime<Utc>) -> Result<String, SyncError> {
        let claims = Claims {
            iss: &self.key.client_email,
            scope: SHEETS_SCOPE,
            aud: &self.key.token_uri,
            iat: now.timestamp(),
            exp: (now + Duration::hours(1)).timestamp(),
        };
        let key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|err| SyncError::InvalidInput(format!("service account private key: {err}")))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|err| SyncError::InvalidInput(format!("signing token request: {err}")))
    }
}

#[async_trait]
impl TokenProvider for ServiceAccountTokens {
    async fn access_token(&self) -> Result<String, SyncError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref().filter(|t| t.refresh_after > now) {
            return Ok(token.token.clone());
        }

        let assertion = self.signed_assertion(now)?;
        let resp = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|err| sync_error_from_reqwest("token exchange", err))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(match crate::classify_status(status) {
                crate::RetryDisposition::Retryable => {
                    SyncError::transient("token exchange", format!("http {status}: {body}"))
                }
                crate::RetryDisposition::NonRetryable => {
                    SyncError::NotConfigured(format!("google credentials ({status}: {body})"))
                }
            });
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|err| SyncError::rejected("token exchange", err))?;
        debug!(client_email = %self.key.client_email, expires_in = token.expires_in, "issued sheets token");

        let refresh_after = now + Duration::seconds((token.expires_in - 60).max(0));
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            refresh_after,
        });
        Ok(token.access_token)
    }
}

/// `GOOGLE_ACCESS_TOKEN` wins; otherwise a service account from the environment.
pub fn load_token_provider_from_env(
    http: reqwest::Client,
) -> Result<Option<Arc<dyn TokenProvider>>, SyncError> {
    if let Ok(token) = std::env::var("GOOGLE_ACCESS_TOKEN") {
        if !token.trim().is_empty() {
            return Ok(Some(Arc::new(StaticToken(token))));
        }
    }
    Ok(ServiceAccountKey::from_env()?
        .map(|key| Arc::new(ServiceAccountTokens::new(key, http)) as Arc<dyn TokenProvider>))
}
