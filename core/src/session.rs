use crate::auth::{AuthResponse, SessionEvent, UserInfo};
use crate::client::{ApiClient, RequestConfig};
use crate::config::ClientSettings;
use crate::error::ApiError;
use crate::watchdog::TokenWatchdog;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct ChangePasswordRequest<'a> {
    old_password: &'a str,
    new_password: &'a str,
}

/// Login state for one user: the credential lifecycle plus who is signed in.
#[derive(Clone)]
pub struct Session {
    client: ApiClient,
    watchdog: Arc<TokenWatchdog>,
    user: Arc<RwLock<Option<UserInfo>>>,
}

impl Session {
    pub fn new(client: ApiClient, settings: &ClientSettings) -> Self {
        let watchdog = TokenWatchdog::new(
            client.coordinator().clone(),
            settings.refresh_window,
            settings.check_interval,
        );
        Self {
            client,
            watchdog: Arc::new(watchdog),
            user: Arc::new(RwLock::new(None)),
        }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn watchdog(&self) -> &TokenWatchdog {
        &self.watchdog
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.client.coordinator().subscribe()
    }

    pub fn current_user(&self) -> Option<UserInfo> {
        self.user.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.client.credentials().is_authenticated() && self.user.read().is_some()
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<UserInfo, ApiError> {
        let response: AuthResponse = self
            .client
            .dispatch(RequestConfig::post("/v1/auth/login").json(&LoginRequest { username, password })?)
            .await?;
        self.begin(response).await
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<UserInfo, ApiError> {
        let response: AuthResponse = self
            .client
            .dispatch(RequestConfig::post("/v1/auth/register").json(&RegisterRequest {
                username,
                email,
                password,
            })?)
            .await?;
        self.begin(response).await
    }

    async fn begin(&self, response: AuthResponse) -> Result<UserInfo, ApiError> {
        self.client.credentials().set(response.credential())?;
        let user = match response.user.clone() {
            Some(user) => user,
            None => self.fetch_user().await?,
        };
        *self.user.write() = Some(user.clone());
        self.watchdog.start();
        info!(username = %user.username, "signed in");
        Ok(user)
    }

    /// Picks up a persisted session at start-up. Returns `None` when the user
    /// has to sign in again.
    pub async fn restore(&self) -> Result<Option<UserInfo>, ApiError> {
        let credentials = self.client.credentials();
        let Some(credential) = credentials.load()? else {
            return Ok(None);
        };

        if credential.is_expired(Utc::now()) {
            if !credential.has_refresh_token() {
                self.client.coordinator().end_session(SessionEvent::Expired);
                return Ok(None);
            }
            if let Err(err) = self.client.coordinator().request_refresh().await {
                warn!(error = %err, "could not refresh persisted session");
                return Ok(None);
            }
        }

        match self.fetch_user().await {
            Ok(user) => {
                *self.user.write() = Some(user.clone());
                self.watchdog.start();
                Ok(Some(user))
            }
            Err(err) => {
                warn!(error = %err, "persisted session rejected, signing out");
                self.watchdog.stop();
                self.client.coordinator().end_session(SessionEvent::Expired);
                *self.user.write() = None;
                Ok(None)
            }
        }
    }

    pub async fn fetch_user(&self) -> Result<UserInfo, ApiError> {
        let user: UserInfo = self.client.get("/v1/user/me").await?;
        *self.user.write() = Some(user.clone());
        Ok(user)
    }

    pub async fn change_password(&self, old_password: &str, new_password: &str) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .client
            .put(
                "/v1/user/password",
                &ChangePasswordRequest {
                    old_password,
                    new_password,
                },
            )
            .await?;
        Ok(())
    }

    pub fn logout(&self) {
        self.watchdog.stop();
        *self.user.write() = None;
        if self.client.coordinator().end_session(SessionEvent::LoggedOut) {
            info!("signed out");
        }
    }
}
