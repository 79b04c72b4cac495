use anyhow::{anyhow, Context, Result};
use opswatch_core::{ApiClient, ClientSettings, CredentialStore, FileKeyValueStore, Session};
use std::sync::Arc;
use tracing::debug;

/// Resolves client settings, reporting config problems in user terms.
pub fn load_settings(base_url: Option<&str>) -> Result<ClientSettings> {
    let mut settings = ClientSettings::load().map_err(|err| anyhow!(err.user_message()))?;
    if let Some(url) = base_url {
        settings.base_url = url.to_string();
    }
    debug!(base_url = %settings.base_url, "client settings loaded");
    Ok(settings)
}

/// Wires the credential store, dispatcher and session together.
pub fn build_session(settings: &ClientSettings) -> Result<Session> {
    let backend = FileKeyValueStore::new(settings.credentials_dir.clone());
    let credentials = CredentialStore::new(Arc::new(backend));
    let client = ApiClient::new(settings, credentials)
        .map_err(|err| anyhow!(err))
        .context("failed to set up the HTTP client")?;
    Ok(Session::new(client, settings))
}
