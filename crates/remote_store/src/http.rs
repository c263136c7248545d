use std::{collections::BTreeMap, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use shared::{
    domain::{Node, StorePath, UserId},
    error::{AuthError, StoreError},
    protocol::{
        PasswordAuthRequest, PasswordAuthResponse, ServiceErrorEnvelope, SIGN_IN_ACTION,
        SIGN_UP_ACTION,
    },
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::{AuthProvider, RecordStore};

pub const DEFAULT_AUTH_URL: &str = "https://identitytoolkit.googleapis.com/v1";
const FORBIDDEN_KEY_CHARS: &[char] = &['.', '$', '#', '[', ']', '/'];

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Realtime-database root, e.g. `https://<project>.firebaseio.com`.
    pub database_url: String,
    pub auth_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
}

impl HttpBackendConfig {
    pub fn new(database_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

struct AuthSession {
    user_id: UserId,
    id_token: String,
}

/// Hosted identity-toolkit and realtime-database REST client. One instance
/// holds at most one signed-in session, whose id token authorizes every
/// database request.
pub struct HttpBackend {
    http: Client,
    database_url: Url,
    auth_url: String,
    api_key: String,
    session: RwLock<Option<AuthSession>>,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self> {
        let database_url = Url::parse(&config.database_url)
            .with_context(|| format!("invalid database url '{}'", config.database_url))?;
        if database_url.cannot_be_a_base() {
            anyhow::bail!("database url '{}' cannot carry a path", config.database_url);
        }
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            database_url,
            auth_url: config.auth_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            session: RwLock::new(None),
        })
    }

    async fn password_auth(
        &self,
        action: &str,
        email: &str,
        password: &str,
    ) -> Result<UserId, AuthError> {
        let response = self
            .http
            .post(format!("{}/{action}", self.auth_url))
            .query(&[("key", self.api_key.as_str())])
            .json(&PasswordAuthRequest::new(email, password))
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = service_error_message(response).await;
            warn!(action, %status, %message, "auth request rejected");
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(AuthError::RateLimited);
            }
            return Err(AuthError::from_service_message(&message));
        }

        let body: PasswordAuthResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Rejected(format!("malformed auth response: {e}")))?;
        let user_id = UserId::new(body.local_id);
        *self.session.write().await = Some(AuthSession {
            user_id: user_id.clone(),
            id_token: body.id_token,
        });
        info!(action, user_id = %user_id, "auth session established");
        Ok(user_id)
    }

    async fn node_url(&self, path: &StorePath) -> Result<Url, StoreError> {
        for segment in path.segments() {
            validate_segment(segment).map_err(|_| StoreError::InvalidPath(path.to_string()))?;
        }

        let mut url = self.database_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StoreError::InvalidPath(path.to_string()))?;
            segments.pop_if_empty();
            match path.segments().split_last() {
                Some((last, parents)) => {
                    segments.extend(parents);
                    segments.push(&format!("{last}.json"));
                }
                None => {
                    segments.push(".json");
                }
            }
        }

        if let Some(session) = self.session.read().await.as_ref() {
            url.query_pairs_mut().append_pair("auth", &session.id_token);
        }
        Ok(url)
    }
}

fn validate_segment(segment: &str) -> Result<(), ()> {
    if segment.is_empty()
        || segment.contains(FORBIDDEN_KEY_CHARS)
        || segment.chars().any(char::is_control)
    {
        return Err(());
    }
    Ok(())
}

async fn service_error_message(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if let Ok(envelope) = serde_json::from_str::<ServiceErrorEnvelope>(&body) {
        return envelope.error.message;
    }
    // The database answers with `{"error": "<text>"}` rather than the envelope.
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(&body) {
        if let Some(serde_json::Value::String(message)) = map.get("error") {
            return message.clone();
        }
    }
    if body.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        body
    }
}

fn is_permission_status(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

#[async_trait]
impl AuthProvider for HttpBackend {
    async fn authenticate(&self, email: &str, password: &str) -> Result<UserId, AuthError> {
        self.password_auth(SIGN_IN_ACTION, email, password).await
    }

    async fn create_account(&self, email: &str, password: &str) -> Result<UserId, AuthError> {
        self.password_auth(SIGN_UP_ACTION, email, password).await
    }

    async fn invalidate_session(&self) -> Result<(), AuthError> {
        // Id tokens cannot be revoked from the client; dropping ours ends the session here.
        if let Some(previous) = self.session.write().await.take() {
            debug!(user_id = %previous.user_id, "auth session dropped");
        }
        Ok(())
    }

    async fn current_user(&self) -> Option<UserId> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|session| session.user_id.clone())
    }
}

#[async_trait]
impl RecordStore for HttpBackend {
    async fn write_record(
        &self,
        path: &StorePath,
        fields: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let url = self.node_url(path).await?;
        let response = self
            .http
            .put(url)
            .json(&fields)
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        let status = response.status();
        if is_permission_status(status) {
            return Err(StoreError::PermissionDenied);
        }
        if !status.is_success() {
            return Err(StoreError::WriteFailed(service_error_message(response).await));
        }
        debug!(path = %path, "record written");
        Ok(())
    }

    async fn read_subtree(&self, path: &StorePath) -> Result<Option<Node>, StoreError> {
        let url = self.node_url(path).await?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        let status = response.status();
        if is_permission_status(status) {
            return Err(StoreError::PermissionDenied);
        }
        if !status.is_success() {
            return Err(StoreError::ReadFailed(service_error_message(response).await));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| StoreError::ReadFailed(format!("malformed snapshot: {e}")))?;
        Ok(Node::from_json(body))
    }
}
