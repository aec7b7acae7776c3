use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const API_VERSION: &str = "0.1.0";

/// Metric names recognized by the digest pipeline. Every other metric coming
/// back from the CRM is ignored at the classification boundary.
pub const METRIC_PAGE_VIEWED: &str = "Page Viewed";
pub const METRIC_PRODUCT_VIEWED: &str = "Product Viewed";

/// One CRM event record after defensive normalization. The raw records vary
/// by API revision (attribute nesting differs), so this is the single uniform
/// shape the rest of the pipeline consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub datetime: Option<String>,
    pub metric_name: String,
    pub properties: Map<String, Value>,
}

/// A normalized event classified into one of the two kinds the digest cares
/// about. Downstream stages match on this exhaustively instead of digging
/// through a stringly-typed properties bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackedEvent {
    PageView {
        ts: Option<String>,
        url_path: Option<String>,
        title: Option<String>,
        topic: Option<String>,
        dwell_seconds: Option<f64>,
    },
    ProductView {
        ts: Option<String>,
        url_path: Option<String>,
        title: Option<String>,
        topic: Option<String>,
        product_id: Option<String>,
        product_name: Option<String>,
        price: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestPeriod {
    pub since: String,
    pub until: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestStats {
    pub page_views: u64,
    pub product_views: u64,
    pub total_dwell_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestTopic {
    pub topic: String,
    pub score: f64,
    pub page_views: u64,
    pub product_views: u64,
    pub dwell_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestProduct {
    pub product_id: String,
    pub product_name: String,
    pub views: u64,
    pub last_seen: Option<String>,
    pub avg_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyDigest {
    pub period: DigestPeriod,
    pub stats: DigestStats,
    pub top_topics: Vec<DigestTopic>,
    pub top_products: Vec<DigestProduct>,
    pub narrative: String,
}

/// Deterministic-digest product projection handed to the AI stage as
/// grounding context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateProduct {
    pub product_id: String,
    pub product_name: String,
    pub avg_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferredTopic {
    pub topic: String,
    pub confidence: f64,
    pub evidence: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedProduct {
    pub product_id: Option<String>,
    pub product_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiDigestResult {
    pub headline: String,
    pub summary: String,
    pub inferred_topics: Vec<InferredTopic>,
    pub recommended_products: Vec<RecommendedProduct>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpsertProfileRequest {
    pub email: String,
    #[serde(default)]
    pub preferences: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PageViewRequest {
    pub email: String,
    #[serde(default)]
    pub url_path: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub dwell_seconds: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProductViewRequest {
    pub email: String,
    pub product_id: String,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub url_path: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateDigestRequest {
    pub email: String,
    #[serde(default)]
    pub days: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackResponse {
    pub ok: bool,
    pub profile_id: String,
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertProfileResponse {
    pub ok: bool,
    pub profile_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DigestMeta {
    pub fetched_events: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateDigestResponse {
    pub ok: bool,
    pub email: String,
    pub profile_id: String,
    pub digest: WeeklyDigest,
    pub ai_digest: Option<AiDigestResult>,
    pub ai_used: bool,
    pub events: Vec<TrackedEvent>,
    pub meta: DigestMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub api_version: String,
    pub klaviyo_revision: String,
    pub has_klaviyo_key: bool,
    pub ai_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

impl ErrorResponse {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.to_string(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error.details = Some(details);
        self
    }
}

impl TrackedEvent {
    pub fn topic(&self) -> Option<&str> {
        match self {
            TrackedEvent::PageView { topic, .. } | TrackedEvent::ProductView { topic, .. } => {
                topic.as_deref()
            }
        }
    }

    pub fn url_path(&self) -> Option<&str> {
        match self {
            TrackedEvent::PageView { url_path, .. }
            | TrackedEvent::ProductView { url_path, .. } => url_path.as_deref(),
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            TrackedEvent::PageView { title, .. } | TrackedEvent::ProductView { title, .. } => {
                title.as_deref()
            }
        }
    }
}
