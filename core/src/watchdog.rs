use crate::auth::{RefreshCoordinator, SessionEvent};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a single expiry check decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No credential to look after.
    Idle,
    Fresh,
    Refreshed,
    RefreshFailed,
    /// Expired with nothing to refresh it with.
    LoggedOut,
}

/// Periodic background check that refreshes the credential before it
/// expires and ends sessions that can no longer be refreshed.
pub struct TokenWatchdog {
    coordinator: RefreshCoordinator,
    refresh_window: Duration,
    check_interval: Duration,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TokenWatchdog {
    pub fn new(
        coordinator: RefreshCoordinator,
        refresh_window: Duration,
        check_interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            refresh_window,
            check_interval,
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Starts checking every `check_interval`, replacing any earlier task.
    pub fn start(&self) {
        let token = CancellationToken::new();
        let coordinator = self.coordinator.clone();
        let window = self.refresh_window;
        let period = self.check_interval;
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; the first check is one period out.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        check(&coordinator, Utc::now(), window).await;
                    }
                }
            }
            debug!("token watchdog stopped");
        });

        if let Some((previous, _)) = self.task.lock().replace((token, handle)) {
            previous.cancel();
        }
        info!(interval = ?period, "token watchdog started");
    }

    pub fn stop(&self) {
        if let Some((token, _)) = self.task.lock().take() {
            token.cancel();
        }
    }

    pub async fn check_once(&self, now: DateTime<Utc>) -> CheckOutcome {
        check(&self.coordinator, now, self.refresh_window).await
    }
}

impl Drop for TokenWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn check(coordinator: &RefreshCoordinator, now: DateTime<Utc>, window: Duration) -> CheckOutcome {
    let Some(credential) = coordinator.credentials().current() else {
        return CheckOutcome::Idle;
    };

    if credential.is_expired(now) {
        if !credential.has_refresh_token() {
            warn!("access token expired and cannot be refreshed");
            coordinator.end_session(SessionEvent::Expired);
            return CheckOutcome::LoggedOut;
        }
    } else if !credential.is_expiring_soon(now, window) || !credential.has_refresh_token() {
        return CheckOutcome::Fresh;
    }

    match coordinator.request_refresh().await {
        Ok(_) => CheckOutcome::Refreshed,
        Err(err) => {
            warn!(error = %err, "scheduled token refresh failed");
            CheckOutcome::RefreshFailed
        }
    }
}
