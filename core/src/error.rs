use std::time::Duration;

/// Failure taxonomy shared by the dispatcher, the refresh coordinator and the
/// stream decoder.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The envelope carried a code other than 200.
    #[error("{0}")]
    Application(String),
    /// The server answered 401 even after the credential was refreshed.
    #[error("unauthorized")]
    Unauthorized,
    /// The refresh call itself failed; the session is gone.
    #[error("session expired")]
    AuthExpired,
    #[error("network error: {message}")]
    Network {
        status: Option<u16>,
        message: String,
    },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// A single malformed frame. Recoverable; the stream keeps going.
    #[error("malformed stream frame: {0}")]
    StreamParse(String),
    /// The server put an `error` field on a stream event.
    #[error("{0}")]
    StreamTerminal(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("request body could not be encoded: {0}")]
    InvalidRequest(String),
    #[error("credential storage failed: {0}")]
    Storage(String),
}

impl ApiError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            status: None,
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Network {
            status: Some(status),
            message: message.into(),
        }
    }

    pub(crate) fn from_transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            return Self::Timeout(timeout);
        }
        Self::Network {
            status: err.status().map(|status| status.as_u16()),
            message: err.to_string(),
        }
    }

    /// Unauthorized and AuthExpired both end the session.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::AuthExpired)
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Application(message) => message.clone(),
            Self::Unauthorized | Self::AuthExpired => {
                "Your session has expired, please sign in again.".to_string()
            }
            Self::Network {
                status: Some(status),
                ..
            } => format!("Request failed with HTTP status {status}."),
            Self::Network { status: None, .. } => "Network error".to_string(),
            Self::Timeout(_) => "The request timed out, please try again.".to_string(),
            Self::StreamParse(_) | Self::InvalidResponse(_) => {
                "The server sent an unexpected response.".to_string()
            }
            Self::InvalidRequest(_) => "The request could not be sent.".to_string(),
            Self::StreamTerminal(message) => message.clone(),
            Self::Storage(detail) => format!("Could not save credentials: {detail}"),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}
