use crate::client::{RequestConfig, Transport};
use crate::credential::{Credential, CredentialStore};
use crate::error::ApiError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Signals that the session ended and the caller should go back to login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Expired,
    LoggedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    pub role: String,
    #[serde(default)]
    pub status: String,
}

impl UserInfo {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// Payload of the login, register and refresh endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub refresh_token: String,
    /// Lifetime of `token` in seconds.
    pub expires_in: i64,
    #[serde(default)]
    pub user: Option<UserInfo>,
}

impl AuthResponse {
    pub fn credential(&self) -> Credential {
        let refresh_token = Some(self.refresh_token.clone()).filter(|t| !t.is_empty());
        Credential::expiring_in(self.token.clone(), refresh_token, Utc::now(), self.expires_in)
    }
}

/// Exchanges a refresh token for a new credential.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, ApiError>;
}

/// Refreshes through `POST /v1/auth/refresh`. Goes straight to the transport
/// so a 401 here never loops back into the coordinator.
pub struct HttpTokenRefresher {
    transport: Transport,
    timeout: Duration,
}

impl HttpTokenRefresher {
    pub const PATH: &'static str = "/v1/auth/refresh";

    pub fn new(transport: Transport, timeout: Duration) -> Self {
        Self { transport, timeout }
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, ApiError> {
        let config = RequestConfig::post(Self::PATH).json(&RefreshRequest { refresh_token })?;
        let response: AuthResponse = self
            .transport
            .send(&config, None, self.timeout)
            .await?
            .into_data()?;
        Ok(response.credential())
    }
}

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    pending: Vec<oneshot::Sender<Result<String, ApiError>>>,
}

struct CoordinatorInner {
    credentials: CredentialStore,
    refresher: Arc<dyn TokenRefresher>,
    state: Mutex<RefreshState>,
    events: broadcast::Sender<SessionEvent>,
}

/// Single-flight token refresh.
///
/// However many callers ask for a refresh while one is running, exactly one
/// refresh call is made and every caller receives its outcome, in the order
/// they asked.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RefreshCoordinator {
    pub fn new(credentials: CredentialStore, refresher: Arc<dyn TokenRefresher>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(CoordinatorInner {
                credentials,
                refresher,
                state: Mutex::new(RefreshState::default()),
                events,
            }),
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.state.lock().refreshing
    }

    /// Resolves with the new access token, or `AuthExpired` once the session
    /// has been cleared.
    pub async fn request_refresh(&self) -> Result<String, ApiError> {
        let (tx, rx) = oneshot::channel();
        let leader = {
            let mut state = self.inner.state.lock();
            state.pending.push(tx);
            !std::mem::replace(&mut state.refreshing, true)
        };
        if leader {
            // Detached so a caller that gives up cannot strand the queue.
            let this = self.clone();
            tokio::spawn(async move { this.run_refresh().await });
        }
        rx.await.unwrap_or(Err(ApiError::AuthExpired))
    }

    async fn run_refresh(&self) {
        let outcome = self.perform_refresh().await;
        let pending = {
            let mut state = self.inner.state.lock();
            state.refreshing = false;
            std::mem::take(&mut state.pending)
        };
        for waiter in pending {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn perform_refresh(&self) -> Result<String, ApiError> {
        let Some(refresh_token) = self.inner.credentials.refresh_token() else {
            warn!("no refresh token available, ending session");
            self.end_session(SessionEvent::Expired);
            return Err(ApiError::AuthExpired);
        };

        let refreshed = match self.inner.refresher.refresh(&refresh_token).await {
            Ok(credential) => credential,
            Err(err) => {
                warn!(error = %err, "token refresh failed, ending session");
                self.end_session(SessionEvent::Expired);
                return Err(ApiError::AuthExpired);
            }
        };

        match self
            .inner
            .credentials
            .replace_refreshed(&refresh_token, refreshed)
        {
            Ok(Some(stored)) => {
                info!(expires_at = ?stored.expires_at, "access token refreshed");
                Ok(stored.access_token)
            }
            Ok(None) => {
                debug!("session ended while refreshing, discarding refreshed credential");
                Err(ApiError::AuthExpired)
            }
            Err(err) => {
                warn!(error = %err, "failed to store refreshed credential, ending session");
                self.end_session(SessionEvent::Expired);
                Err(ApiError::AuthExpired)
            }
        }
    }

    /// Clears the credential and publishes `reason` if a credential was
    /// present. Returns whether anything was cleared.
    pub fn end_session(&self, reason: SessionEvent) -> bool {
        match self.inner.credentials.clear() {
            Ok(true) => {
                let _ = self.inner.events.send(reason);
                true
            }
            Ok(false) => false,
            Err(err) => {
                warn!(error = %err, "failed to clear persisted credential");
                let _ = self.inner.events.send(reason);
                true
            }
        }
    }
}
