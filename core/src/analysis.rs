use crate::client::{ApiClient, RequestConfig};
use crate::error::ApiError;
use crate::stream::StreamHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const DEFAULT_HOURS: u32 = 24;
const DEFAULT_CAPACITY_TYPE: &str = "cpu";
const DEFAULT_CAPACITY_DAYS: u32 = 30;
const DEFAULT_CAPACITY_THRESHOLD: u32 = 80;
const TASK_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyQuery {
    pub host_id: String,
    pub metric_type: Option<String>,
    pub hours: Option<u32>,
}

impl AnomalyQuery {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            metric_type: None,
            hours: None,
        }
    }

    fn to_query(&self) -> Vec<(String, String)> {
        let mut query = vec![
            ("host_id".to_string(), self.host_id.clone()),
            ("hours".to_string(), self.hours.unwrap_or(DEFAULT_HOURS).to_string()),
        ];
        if let Some(metric) = &self.metric_type {
            query.push(("metric_type".to_string(), metric.clone()));
        }
        query
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeQuery {
    pub q: String,
    pub category: Option<String>,
}

/// Capacity forecast for one host and resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityQuery {
    pub host_id: String,
    /// `cpu`, `memory` or `disk`; sent as `type`.
    pub resource_type: Option<String>,
    pub days: Option<u32>,
    /// Percent utilisation the forecast is measured against.
    pub threshold: Option<u32>,
}

impl CapacityQuery {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            resource_type: None,
            days: None,
            threshold: None,
        }
    }

    fn to_query(&self) -> Vec<(String, String)> {
        vec![
            ("host_id".to_string(), self.host_id.clone()),
            (
                "type".to_string(),
                self.resource_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CAPACITY_TYPE.to_string()),
            ),
            (
                "days".to_string(),
                self.days.unwrap_or(DEFAULT_CAPACITY_DAYS).to_string(),
            ),
            (
                "threshold".to_string(),
                self.threshold.unwrap_or(DEFAULT_CAPACITY_THRESHOLD).to_string(),
            ),
        ]
    }
}

/// Which analysis to stream.
#[derive(Debug, Clone)]
pub enum AnalysisRequest {
    Anomaly(AnomalyQuery),
    Performance { host_id: String, hours: Option<u32> },
    InspectionReport { report_id: i64 },
    KnowledgeSearch(KnowledgeQuery),
    CostOptimization { host_id: String },
    Capacity(CapacityQuery),
}

impl AnalysisRequest {
    pub fn path(&self) -> String {
        match self {
            Self::Anomaly(_) => "/v1/anomalies/detect/stream".to_string(),
            Self::Performance { .. } => "/v1/performance/analysis/stream".to_string(),
            Self::InspectionReport { report_id } => {
                format!("/v1/inspection/reports/{report_id}/stream")
            }
            Self::KnowledgeSearch(_) => "/v1/knowledge/search/stream".to_string(),
            Self::CostOptimization { .. } => "/v1/predictions/cost-optimization/stream".to_string(),
            Self::Capacity(_) => "/v1/predictions/capacity/stream".to_string(),
        }
    }

    pub fn query(&self) -> Vec<(String, String)> {
        match self {
            Self::Anomaly(query) => query.to_query(),
            Self::Performance { host_id, hours } => vec![
                ("host_id".to_string(), host_id.clone()),
                ("hours".to_string(), hours.unwrap_or(DEFAULT_HOURS).to_string()),
            ],
            Self::InspectionReport { .. } => Vec::new(),
            Self::KnowledgeSearch(query) => {
                let mut pairs = vec![("q".to_string(), query.q.clone())];
                if let Some(category) = &query.category {
                    pairs.push(("category".to_string(), category.clone()));
                }
                pairs
            }
            Self::CostOptimization { host_id } => vec![("host_id".to_string(), host_id.clone())],
            Self::Capacity(query) => query.to_query(),
        }
    }
}

/// The AI analysis features. Payloads are passed through untouched.
#[derive(Clone)]
pub struct AnalysisApi {
    client: ApiClient,
}

impl AnalysisApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    pub fn stream(&self, request: &AnalysisRequest) -> StreamHandle {
        self.client.stream(&request.path(), &request.query())
    }

    /// Runs anomaly detection synchronously; this can take minutes.
    pub async fn detect_anomalies(&self, query: &AnomalyQuery) -> Result<Value, ApiError> {
        let mut config = RequestConfig::post("/v1/anomalies/detect").timeout(self.client.analysis_timeout());
        config.query = query.to_query();
        self.client.dispatch(config).await
    }

    pub async fn llm_task_status(&self, task_id: &str) -> Result<Value, ApiError> {
        self.client
            .dispatch(
                RequestConfig::get(format!("/v1/predictions/task/{task_id}"))
                    .timeout(TASK_STATUS_TIMEOUT),
            )
            .await
    }
}
