pub mod analysis;
pub mod auth;
pub mod client;
pub mod config;
pub mod credential;
pub mod error;
pub mod session;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod watchdog;

pub use analysis::{AnalysisApi, AnalysisRequest, AnomalyQuery, CapacityQuery, KnowledgeQuery};
pub use auth::{AuthResponse, RefreshCoordinator, SessionEvent, TokenRefresher, UserInfo};
pub use client::{ApiClient, Envelope, Method, RequestConfig};
pub use config::ClientSettings;
pub use credential::{Credential, CredentialStore};
pub use error::ApiError;
pub use session::Session;
pub use store::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use stream::{CancelHandle, StreamEvent, StreamHandle, StreamListener, StreamState, StreamUpdate};
pub use watchdog::{CheckOutcome, TokenWatchdog};
