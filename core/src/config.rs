use crate::credential::DEFAULT_REFRESH_WINDOW;
use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const BASE_URL_ENV: &str = "OPSWATCH_API_BASE_URL";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_ANALYSIS_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Runtime settings for the network client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub request_timeout: Duration,
    /// Used by the long-running analysis endpoints.
    pub analysis_timeout: Duration,
    pub connect_timeout: Duration,
    pub refresh_window: Duration,
    pub check_interval: Duration,
    pub credentials_dir: PathBuf,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            analysis_timeout: DEFAULT_ANALYSIS_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            refresh_window: DEFAULT_REFRESH_WINDOW,
            check_interval: DEFAULT_CHECK_INTERVAL,
            credentials_dir: config_dir(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("client configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Invalid(detail) => format!("OpsWatch not configured—{detail}. Update opswatch.yaml."),
        }
    }
}

impl ClientSettings {
    /// Reads `opswatch.yaml` from the user config directory, if present, then
    /// applies the base URL environment override.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = match locate_config_file() {
            Some(path) => {
                let contents = fs::read_to_string(&path).map_err(|err| {
                    ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
                })?;
                Self::from_yaml(&contents)?
            }
            None => Self::default(),
        };
        if let Ok(url) = std::env::var(BASE_URL_ENV) {
            if !url.trim().is_empty() {
                settings.base_url = url.trim().to_string();
            }
        }
        Ok(settings)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: OpsWatchConfig = serde_yaml::from_str(contents)
            .map_err(|err| ConfigError::Invalid(format!("invalid opswatch.yaml: {err}")))?;
        resolve_client_section(config.client.unwrap_or_default())
    }
}

fn resolve_client_section(section: ClientSection) -> Result<ClientSettings, ConfigError> {
    let defaults = ClientSettings::default();
    let base_url = match section.base_url {
        Some(url) => {
            let url = url.trim().to_string();
            url::Url::parse(&url)
                .map_err(|err| ConfigError::Invalid(format!("base_url `{url}`: {err}")))?;
            url
        }
        None => defaults.base_url,
    };
    Ok(ClientSettings {
        base_url,
        request_timeout: seconds(section.request_timeout_secs, "request_timeout_secs")?
            .unwrap_or(defaults.request_timeout),
        analysis_timeout: seconds(section.analysis_timeout_secs, "analysis_timeout_secs")?
            .unwrap_or(defaults.analysis_timeout),
        connect_timeout: seconds(section.connect_timeout_secs, "connect_timeout_secs")?
            .unwrap_or(defaults.connect_timeout),
        refresh_window: section
            .refresh_window_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.refresh_window),
        check_interval: seconds(section.check_interval_secs, "check_interval_secs")?
            .unwrap_or(defaults.check_interval),
        credentials_dir: section.credentials_dir.unwrap_or(defaults.credentials_dir),
    })
}

fn seconds(value: Option<u64>, field: &str) -> Result<Option<Duration>, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Invalid(format!("{field} must be greater than zero"))),
        Some(secs) => Ok(Some(Duration::from_secs(secs))),
        None => Ok(None),
    }
}

fn locate_config_file() -> Option<PathBuf> {
    opswatch_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn opswatch_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("opswatch");
        paths.push(config_dir.join("opswatch.yaml"));
        paths.push(config_dir.join("opswatch.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".opswatch").join("opswatch.yaml"));
        paths.push(home_dir.join(".opswatch").join("opswatch.yml"));
    } else {
        paths.push(PathBuf::from("opswatch.yaml"));
        paths.push(PathBuf::from("opswatch.yml"));
    }
    paths
}

fn config_dir() -> PathBuf {
    if let Some(base) = BaseDirs::new() {
        base.config_dir().join("opswatch")
    } else {
        PathBuf::from(".opswatch")
    }
}

#[derive(Debug, Deserialize)]
struct OpsWatchConfig {
    client: Option<ClientSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ClientSection {
    base_url: Option<String>,
    request_timeout_secs: Option<u64>,
    analysis_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    refresh_window_secs: Option<u64>,
    check_interval_secs: Option<u64>,
    credentials_dir: Option<PathBuf>,
}
