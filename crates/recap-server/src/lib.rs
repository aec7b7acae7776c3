use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, SecondsFormat, Utc};
use recap_config::{Config, Secrets};
use recap_contracts::{
    CandidateProduct, DigestMeta, ErrorResponse, GenerateDigestRequest, GenerateDigestResponse,
    HealthResponse, PageViewRequest, ProductViewRequest, TrackResponse, TrackedEvent,
    UpsertProfileRequest, UpsertProfileResponse, API_VERSION, METRIC_PAGE_VIEWED,
    METRIC_PRODUCT_VIEWED,
};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

mod ai;
mod klaviyo;

pub use ai::{AiClient, AiError};
pub use klaviyo::{KlaviyoClient, KlaviyoError};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Upper bound on the digest window. Anything past a year is a caller bug,
/// and unchecked values would overflow the window arithmetic.
const MAX_WINDOW_DAYS: u32 = 365;

pub async fn serve(cfg: Config, secrets: Secrets) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg, secrets)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!("listening - addr={addr}");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub fn build_app(cfg: Config, secrets: Secrets) -> Result<Router, String> {
    let state = AppState::new(cfg, secrets)?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/profiles/upsert", post(upsert_profile))
        .route("/v1/track/page-view", post(track_page_view))
        .route("/v1/track/product-view", post(track_product_view))
        .route("/v1/digest/generate", post(generate_digest))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    cfg: Config,
    klaviyo: KlaviyoClient,
    ai: Option<AiClient>,
}

impl AppState {
    fn new(cfg: Config, secrets: Secrets) -> Result<Self, String> {
        let klaviyo = KlaviyoClient::new(
            cfg.klaviyo.api_base.clone(),
            secrets.klaviyo_private_key,
            cfg.klaviyo.revision.clone(),
            cfg.klaviyo.page_size,
        )
        .map_err(|e| format!("klaviyo client init failed: {e}"))?;

        let ai = match secrets.openai_api_key {
            Some(key) => Some(
                AiClient::new(
                    secrets.openai_api_base,
                    key,
                    cfg.ai.model.clone(),
                    cfg.ai.max_events,
                )
                .map_err(|e| format!("ai client init failed: {e}"))?,
            ),
            None => None,
        };

        Ok(Self { cfg, klaviyo, ai })
    }
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        api_version: API_VERSION.to_string(),
        klaviyo_revision: state.cfg.klaviyo.revision.clone(),
        has_klaviyo_key: true,
        ai_enabled: state.ai.is_some(),
    })
}

async fn upsert_profile(
    State(state): State<AppState>,
    Json(req): Json<UpsertProfileRequest>,
) -> Result<Json<UpsertProfileResponse>, ApiError> {
    let email = require_email(&req.email)?;
    let properties = req.preferences.unwrap_or_default();

    let profile_id = state
        .klaviyo
        .get_or_create_profile_id(&email, &properties)
        .await
        .map_err(upstream_error)?;

    Ok(Json(UpsertProfileResponse {
        ok: true,
        profile_id,
    }))
}

async fn track_page_view(
    State(state): State<AppState>,
    Json(req): Json<PageViewRequest>,
) -> Result<Json<TrackResponse>, ApiError> {
    let email = require_email(&req.email)?;

    let mut properties = Map::new();
    insert_opt_string(&mut properties, "url_path", req.url_path);
    insert_opt_string(&mut properties, "title", req.title);
    insert_opt_string(&mut properties, "topic", req.topic);
    if let Some(dwell) = req.dwell_seconds.filter(|d| d.is_finite()) {
        properties.insert("dwell_seconds".to_string(), json!(dwell));
    }

    track_event(&state, &email, METRIC_PAGE_VIEWED, properties).await
}

async fn track_product_view(
    State(state): State<AppState>,
    Json(req): Json<ProductViewRequest>,
) -> Result<Json<TrackResponse>, ApiError> {
    let email = require_email(&req.email)?;
    let product_id = req.product_id.trim().to_string();
    if product_id.is_empty() {
        return Err(validation_error("product_id is required"));
    }

    let mut properties = Map::new();
    properties.insert("product_id".to_string(), json!(product_id));
    insert_opt_string(&mut properties, "product_name", req.product_name);
    if let Some(price) = req.price.filter(|p| p.is_finite()) {
        properties.insert("price".to_string(), json!(price));
    }
    insert_opt_string(&mut properties, "url_path", req.url_path);
    properties.insert(
        "topic".to_string(),
        json!(req
            .topic
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("uncategorized")),
    );

    track_event(&state, &email, METRIC_PRODUCT_VIEWED, properties).await
}

async fn track_event(
    state: &AppState,
    email: &str,
    metric_name: &str,
    properties: Map<String, Value>,
) -> Result<Json<TrackResponse>, ApiError> {
    let profile_id = state
        .klaviyo
        .get_or_create_profile_id(email, &Map::new())
        .await
        .map_err(upstream_error)?;

    let event_id = state
        .klaviyo
        .create_event(&profile_id, metric_name, properties, None, None)
        .await
        .map_err(upstream_error)?;

    Ok(Json(TrackResponse {
        ok: true,
        profile_id,
        event_id,
    }))
}

async fn generate_digest(
    State(state): State<AppState>,
    Json(req): Json<GenerateDigestRequest>,
) -> Result<Json<GenerateDigestResponse>, ApiError> {
    let email = require_email(&req.email)?;
    let days = req.days.unwrap_or(state.cfg.digest.window_days);
    if days == 0 || days > MAX_WINDOW_DAYS {
        return Err(validation_error("days must be between 1 and 365"));
    }

    let until = Utc::now();
    let since = until - Duration::days(i64::from(days));
    let since_str = since.to_rfc3339_opts(SecondsFormat::Secs, true);
    let until_str = until.to_rfc3339_opts(SecondsFormat::Secs, true);

    let profile_id = state
        .klaviyo
        .get_or_create_profile_id(&email, &Map::new())
        .await
        .map_err(upstream_error)?;

    let normalized = state
        .klaviyo
        .list_recent_events(&profile_id, &since_str, state.cfg.klaviyo.max_pages)
        .await
        .map_err(upstream_error)?;
    let fetched_events = normalized.len();

    let events: Vec<TrackedEvent> = normalized
        .iter()
        .filter_map(recap_kernel::classify)
        .collect();

    let digest = recap_kernel::build_digest(&since_str, &until_str, &events);

    let (ai_digest, ai_used) = match &state.ai {
        Some(ai) => {
            let candidate_topics: Vec<String> =
                digest.top_topics.iter().map(|t| t.topic.clone()).collect();
            let candidate_products: Vec<CandidateProduct> = digest
                .top_products
                .iter()
                .map(|p| CandidateProduct {
                    product_id: p.product_id.clone(),
                    product_name: p.product_name.clone(),
                    avg_price: p.avg_price,
                })
                .collect();
            match ai
                .generate(
                    &email,
                    &digest.stats,
                    &candidate_topics,
                    &candidate_products,
                    &events,
                )
                .await
            {
                Ok(result) => (Some(result), true),
                Err(e) => {
                    warn!("ai digest failed, returning deterministic digest only - {e}");
                    (None, false)
                }
            }
        }
        None => (None, false),
    };

    info!(
        "digest generated - email={email}, events={}, ai_used={ai_used}",
        events.len()
    );

    Ok(Json(GenerateDigestResponse {
        ok: true,
        email,
        profile_id,
        digest,
        ai_digest,
        ai_used,
        events,
        meta: DigestMeta { fetched_events },
    }))
}

/// Emails are trimmed and lowercased so repeat calls for the same mailbox hit
/// the same CRM profile regardless of caller casing.
fn require_email(email: &str) -> Result<String, ApiError> {
    let email = email.trim().to_lowercase();
    if email.is_empty() {
        return Err(validation_error("email is required"));
    }
    Ok(email)
}

fn insert_opt_string(properties: &mut Map<String, Value>, key: &str, value: Option<String>) {
    if let Some(v) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        properties.insert(key.to_string(), json!(v));
    }
}

fn validation_error(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new("validation_error", message)),
    )
}

fn upstream_error(err: KlaviyoError) -> ApiError {
    match err {
        KlaviyoError::Http { status, body } => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
            Json(
                ErrorResponse::new("upstream.klaviyo", "klaviyo request failed")
                    .with_details(json!({ "status": status, "body": body })),
            ),
        ),
        KlaviyoError::InvalidJson { status, body } => (
            StatusCode::BAD_GATEWAY,
            Json(
                ErrorResponse::new(
                    "upstream.invalid_json",
                    "klaviyo returned a non-JSON response",
                )
                .with_details(json!({ "status": status, "body": body })),
            ),
        ),
        KlaviyoError::Transport(message) => (
            StatusCode::BAD_GATEWAY,
            Json(
                ErrorResponse::new("upstream.transport", "klaviyo request could not be sent")
                    .with_details(json!({ "message": message })),
            ),
        ),
    }
}
