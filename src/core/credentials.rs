//! OAuth credentials for the remote store.
//!
//! The interactive consent flow is out of scope: a token file produced by
//! it is loaded once, refreshed in place when it expires, and written back.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::TransferError;

/// Refresh this long before the reported expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_MARGIN_SECS) >= self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

/// Hands out a credential that is valid right now.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_valid(&self) -> Result<Credential, TransferError>;
}

/// Exchanges a refresh token for a new access token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, TransferError>;
}

/// Credential cache with lazy refresh-on-expiry.
///
/// The lock is held across the refresh, so at most one refresh is in
/// flight and concurrent callers wait for its result.
pub struct CachedCredentials<S> {
    path: Option<PathBuf>,
    source: S,
    state: Mutex<Option<Credential>>,
}

impl<S: TokenSource> CachedCredentials<S> {
    /// Load lazily from a token file, persisting refreshed tokens back to it.
    pub fn from_file(path: PathBuf, source: S) -> Self {
        Self {
            path: Some(path),
            source,
            state: Mutex::new(None),
        }
    }

    /// Start from an in-memory credential that is never persisted.
    pub fn in_memory(credential: Credential, source: S) -> Self {
        Self {
            path: None,
            source,
            state: Mutex::new(Some(credential)),
        }
    }

    async fn load(&self) -> Result<Credential, TransferError> {
        let Some(path) = &self.path else {
            return Err(TransferError::Auth("no credentials available".into()));
        };

        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TransferError::Auth(format!(
                    "no stored credentials at {}; authorize the application and try again",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&raw).map_err(|e| {
            TransferError::Auth(format!(
                "unreadable credentials at {} ({}); authorize the application again",
                path.display(),
                e
            ))
        })
    }

    async fn persist(&self, credential: &Credential) -> Result<(), TransferError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let encoded = serde_json::to_vec_pretty(credential)
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))?;
        let tmp = path.with_extension("json.partial");
        tokio::fs::write(&tmp, encoded).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl<S: TokenSource> CredentialProvider for CachedCredentials<S> {
    async fn get_valid(&self) -> Result<Credential, TransferError> {
        let mut guard = self.state.lock().await;

        let current = match guard.take() {
            Some(credential) => credential,
            None => self.load().await?,
        };

        if !current.is_expired(Utc::now()) {
            *guard = Some(current.clone());
            return Ok(current);
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            *guard = Some(current);
            return Err(TransferError::Auth(
                "access token expired and no refresh token is stored; authorize again".into(),
            ));
        };

        debug!("Refreshing expired access token");
        let mut fresh = match self.source.refresh(&refresh_token).await {
            Ok(fresh) => fresh,
            Err(e) => {
                *guard = Some(current);
                return Err(e);
            }
        };
        if fresh.refresh_token.is_none() {
            fresh.refresh_token = Some(refresh_token);
        }

        self.persist(&fresh).await?;
        info!(expires_at = %fresh.expires_at, "Access token refreshed");

        *guard = Some(fresh.clone());
        Ok(fresh)
    }
}

/// A fixed credential, for the simulated store and tests.
pub struct StaticCredentials(pub Credential);

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_valid(&self) -> Result<Credential, TransferError> {
        Ok(self.0.clone())
    }
}

/// Google's OAuth token endpoint.
pub struct GoogleTokenSource {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl GoogleTokenSource {
    pub fn new(token_url: String, client_id: String, client_secret: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url,
            client_id,
            client_secret,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[async_trait]
impl TokenSource for GoogleTokenSource {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, TransferError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| TransferError::Network(format!("token refresh: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Auth(format!(
                "token refresh rejected ({status}): {}; authorize again",
                body.trim()
            )));
        }
        if !status.is_success() {
            return Err(TransferError::Network(format!(
                "token refresh failed: HTTP {status}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| TransferError::Protocol(format!("token response: {e}")))?;

        Ok(Credential {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }
}
