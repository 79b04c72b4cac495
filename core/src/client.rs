use crate::auth::{HttpTokenRefresher, RefreshCoordinator, SessionEvent, TokenRefresher};
use crate::config::ClientSettings;
use crate::credential::CredentialStore;
use crate::error::ApiError;
use crate::stream::StreamHandle;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub use reqwest::Method;

/// Code carried by every successful envelope.
pub const SUCCESS_CODE: i64 = 200;

/// `{code, message, data}` wrapper around every non-streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        if self.code != SUCCESS_CODE {
            let message = if self.message.is_empty() {
                "Error".to_string()
            } else {
                self.message
            };
            return Err(ApiError::Application(message));
        }
        serde_json::from_value(self.data).map_err(|err| ApiError::InvalidResponse(err.to_string()))
    }
}

/// One logical request/response call.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Overrides the client's default timeout for this call only.
    pub timeout: Option<Duration>,
}

impl RequestConfig {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|err| ApiError::InvalidRequest(err.to_string()))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Shared HTTP plumbing: base URL resolution and envelope decoding.
#[derive(Clone)]
pub struct Transport {
    http: reqwest::Client,
    base_url: String,
}

impl Transport {
    pub fn new(settings: &ClientSettings) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|err| ApiError::network(format!("failed to build HTTP client: {err}")))?;
        Self::with_client(http, &settings.base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: &str) -> Result<Self, ApiError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        Url::parse(&base_url)
            .map_err(|err| ApiError::network(format!("invalid base url `{base_url}`: {err}")))?;
        Ok(Self { http, base_url })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn url(&self, path: &str) -> Result<Url, ApiError> {
        let joined = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        Url::parse(&joined).map_err(|err| ApiError::network(format!("invalid url `{joined}`: {err}")))
    }

    /// Issues one attempt. HTTP failures come back as `ApiError::Network`
    /// carrying the status, so callers can single out 401.
    pub async fn send(
        &self,
        config: &RequestConfig,
        bearer: Option<&str>,
        timeout: Duration,
    ) -> Result<Envelope, ApiError> {
        let url = self.url(&config.path)?;
        let mut request = self
            .http
            .request(config.method.clone(), url)
            .timeout(timeout);
        if !config.query.is_empty() {
            request = request.query(&config.query);
        }
        if let Some(body) = &config.body {
            request = request.json(body);
        }
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ApiError::from_transport(err, timeout))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Envelope>(&body)
                .ok()
                .map(|envelope| envelope.message)
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| format!("HTTP error! status: {}", status.as_u16()));
            return Err(ApiError::status(status.as_u16(), message));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| ApiError::from_transport(err, timeout))?;
        serde_json::from_slice(&body).map_err(|err| ApiError::InvalidResponse(err.to_string()))
    }
}

fn is_unauthorized(err: &ApiError) -> bool {
    matches!(err, ApiError::Network { status: Some(401), .. })
}

/// Authenticated request dispatcher.
#[derive(Clone)]
pub struct ApiClient {
    transport: Transport,
    credentials: CredentialStore,
    coordinator: RefreshCoordinator,
    default_timeout: Duration,
    analysis_timeout: Duration,
}

impl ApiClient {
    /// Builds a client that refreshes through `POST /v1/auth/refresh`.
    pub fn new(settings: &ClientSettings, credentials: CredentialStore) -> Result<Self, ApiError> {
        let transport = Transport::new(settings)?;
        let refresher = Arc::new(HttpTokenRefresher::new(
            transport.clone(),
            settings.request_timeout,
        ));
        Ok(Self::with_parts(settings, transport, credentials, refresher))
    }

    pub fn with_refresher(
        settings: &ClientSettings,
        credentials: CredentialStore,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Self, ApiError> {
        let transport = Transport::new(settings)?;
        Ok(Self::with_parts(settings, transport, credentials, refresher))
    }

    fn with_parts(
        settings: &ClientSettings,
        transport: Transport,
        credentials: CredentialStore,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        let coordinator = RefreshCoordinator::new(credentials.clone(), refresher);
        Self {
            transport,
            credentials,
            coordinator,
            default_timeout: settings.request_timeout,
            analysis_timeout: settings.analysis_timeout,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn analysis_timeout(&self) -> Duration {
        self.analysis_timeout
    }

    /// Performs `config`, refreshing the credential and retrying once if the
    /// server answers 401.
    pub async fn dispatch<T: DeserializeOwned>(&self, config: RequestConfig) -> Result<T, ApiError> {
        let timeout = config.timeout.unwrap_or(self.default_timeout);
        let mut bearer = self.credentials.access_token();
        let mut retried = false;

        loop {
            match self.transport.send(&config, bearer.as_deref(), timeout).await {
                Ok(envelope) => {
                    return envelope.into_data().inspect_err(|err| {
                        warn!(
                            method = %config.method,
                            path = %config.path,
                            error = %err,
                            "request rejected by server"
                        );
                    });
                }
                Err(err) if is_unauthorized(&err) && !retried => {
                    retried = true;
                    let current = self.credentials.access_token();
                    if current.is_some() && current != bearer {
                        debug!(path = %config.path, "access token already rotated, retrying");
                        bearer = current;
                    } else {
                        debug!(path = %config.path, "access token rejected, refreshing");
                        bearer = Some(self.coordinator.request_refresh().await?);
                    }
                }
                Err(err) if is_unauthorized(&err) => {
                    warn!(path = %config.path, "still unauthorized after refresh");
                    self.coordinator.end_session(SessionEvent::Expired);
                    return Err(ApiError::Unauthorized);
                }
                Err(err) => {
                    warn!(
                        method = %config.method,
                        path = %config.path,
                        error = %err,
                        "request failed"
                    );
                    return Err(err);
                }
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.dispatch(RequestConfig::get(path)).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.dispatch(RequestConfig::post(path).json(body)?).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.dispatch(RequestConfig::put(path).json(body)?).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.dispatch(RequestConfig::delete(path)).await
    }

    /// Opens a streaming call with the current credential attached.
    pub fn stream(&self, path: &str, query: &[(String, String)]) -> StreamHandle {
        match self.transport.url(path) {
            Ok(mut url) => {
                if !query.is_empty() {
                    url.query_pairs_mut().extend_pairs(query);
                }
                StreamHandle::connect(
                    self.transport.http().clone(),
                    url,
                    self.credentials.access_token(),
                )
            }
            Err(err) => StreamHandle::failed(err),
        }
    }
}
