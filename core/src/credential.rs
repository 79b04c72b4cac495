use crate::store::KeyValueStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const ACCESS_TOKEN_KEY: &str = "token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const EXPIRES_AT_KEY: &str = "token_expire_time";

/// How long before expiry a credential counts as "expiring soon".
pub const DEFAULT_REFRESH_WINDOW: Duration = Duration::from_secs(5 * 60);

/// The access/refresh token pair handed out by the auth endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Expiry is truncated to whole milliseconds, the resolution it is persisted at.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at: expires_at.map(truncate_to_millis),
        }
    }

    /// Builds a credential from an auth response's `expires_in` (seconds).
    pub fn expiring_in(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        now: DateTime<Utc>,
        expires_in_secs: i64,
    ) -> Self {
        let expires_at = now + chrono::Duration::seconds(expires_in_secs);
        Self::new(access_token, refresh_token, Some(expires_at))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    pub fn is_expiring_soon(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let Some(exp) = self.expires_at else {
            return false;
        };
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        now.timestamp_millis() >= exp.timestamp_millis().saturating_sub(window_ms)
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

fn truncate_to_millis(instant: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(instant.timestamp_millis()).unwrap_or(instant)
}

/// Single source of truth for the current credential.
///
/// Every mutation writes through to the [`KeyValueStore`]; nothing here talks
/// to the network.
#[derive(Clone)]
pub struct CredentialStore {
    current: Arc<RwLock<Option<Credential>>>,
    backend: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            current: Arc::new(RwLock::new(None)),
            backend,
        }
    }

    /// Rehydrates the persisted credential into memory.
    pub fn load(&self) -> Result<Option<Credential>> {
        let Some(access_token) = self.backend.get(ACCESS_TOKEN_KEY)? else {
            *self.current.write() = None;
            return Ok(None);
        };
        let refresh_token = self.backend.get(REFRESH_TOKEN_KEY)?;
        let expires_at = match self.backend.get(EXPIRES_AT_KEY)? {
            None => None,
            Some(raw) => match raw
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
            {
                Some(instant) => Some(instant),
                None => {
                    warn!(value = %raw, "discarding persisted credential with unreadable expiry");
                    self.clear()?;
                    return Ok(None);
                }
            },
        };
        let credential = Credential::new(access_token, refresh_token, expires_at);
        *self.current.write() = Some(credential.clone());
        debug!(expires_at = ?credential.expires_at, "restored persisted credential");
        Ok(Some(credential))
    }

    /// Persists `credential` and makes it current. Memory is untouched if
    /// persisting fails.
    pub fn set(&self, credential: Credential) -> Result<()> {
        let mut current = self.current.write();
        self.persist(&credential)?;
        *current = Some(credential);
        Ok(())
    }

    /// Like [`set`](Self::set), but keeps the expiry strictly increasing across
    /// refreshes. Returns the credential that was actually stored, or `None`
    /// when the credential that `used_refresh_token` belonged to has since been
    /// cleared or replaced.
    pub fn replace_refreshed(
        &self,
        used_refresh_token: &str,
        mut credential: Credential,
    ) -> Result<Option<Credential>> {
        let mut current = self.current.write();
        let Some(existing) = current.as_ref() else {
            return Ok(None);
        };
        if existing.refresh_token.as_deref() != Some(used_refresh_token) {
            return Ok(None);
        }
        let previous = existing.expires_at;
        if let (Some(prev), Some(next)) = (previous, credential.expires_at) {
            if next <= prev {
                warn!(
                    previous = %prev,
                    received = %next,
                    "refreshed credential does not extend expiry, clamping"
                );
                credential.expires_at = Some(prev + chrono::Duration::milliseconds(1));
            }
        }
        self.persist(&credential)?;
        *current = Some(credential.clone());
        Ok(Some(credential))
    }

    /// Drops the credential from memory and storage. Returns whether one was
    /// present.
    pub fn clear(&self) -> Result<bool> {
        let was_present = self.current.write().take().is_some();
        self.backend.remove(ACCESS_TOKEN_KEY)?;
        self.backend.remove(REFRESH_TOKEN_KEY)?;
        self.backend.remove(EXPIRES_AT_KEY)?;
        Ok(was_present)
    }

    pub fn current(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current.read().as_ref().map(|c| c.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.current
            .read()
            .as_ref()
            .filter(|c| c.has_refresh_token())
            .and_then(|c| c.refresh_token.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|c| c.is_expired(now))
    }

    pub fn is_expiring_soon(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|c| c.is_expiring_soon(now, window))
    }

    fn persist(&self, credential: &Credential) -> Result<()> {
        self.backend
            .set(ACCESS_TOKEN_KEY, &credential.access_token)?;
        match credential.refresh_token.as_deref() {
            Some(token) => self.backend.set(REFRESH_TOKEN_KEY, token)?,
            None => self.backend.remove(REFRESH_TOKEN_KEY)?,
        }
        match credential.expires_at {
            Some(exp) => self
                .backend
                .set(EXPIRES_AT_KEY, &exp.timestamp_millis().to_string())?,
            None => self.backend.remove(EXPIRES_AT_KEY)?,
        }
        Ok(())
    }
}
