use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use recap_config::{Ai, Config, Digest, Klaviyo, Secrets, Server};
use recap_server::build_app;
use serde_json::{json, Value};
use tower::util::ServiceExt;

fn test_config(klaviyo_base: &str) -> Config {
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        klaviyo: Klaviyo {
            api_base: klaviyo_base.to_string(),
            revision: "2026-01-15".to_string(),
            page_size: 200,
            max_pages: 5,
        },
        digest: Digest { window_days: 7 },
        ai: Ai {
            model: "gpt-4o-mini".to_string(),
            max_events: 50,
        },
    }
}

fn test_secrets() -> Secrets {
    Secrets {
        klaviyo_private_key: "pk_test".to_string(),
        openai_api_key: None,
        openai_api_base: "http://127.0.0.1:9".to_string(),
    }
}

async fn spawn_stub(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub listener");
    let addr = listener.local_addr().expect("stub local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("stub serve");
    });
    format!("http://{addr}")
}

/// Loopback stand-in for the CRM's JSON:API. Profile lookup misses for any
/// email containing "missing", otherwise resolves to a fixed profile id.
async fn spawn_stub_klaviyo() -> String {
    let router = Router::new()
        .route(
            "/profiles",
            get(|axum::extract::RawQuery(q): axum::extract::RawQuery| async move {
                let query = q.unwrap_or_default();
                if query.contains("missing") {
                    Json(json!({ "data": [] }))
                } else {
                    Json(json!({ "data": [ { "type": "profile", "id": "prof-1" } ] }))
                }
            })
            .post(|| async { Json(json!({ "data": { "type": "profile", "id": "prof-new" } })) }),
        )
        .route(
            "/events",
            get(|| async { Json(events_page()) })
                .post(|| async { Json(json!({ "data": { "type": "event", "id": "evt-1" } })) }),
        );
    spawn_stub(router).await
}

/// One week of activity, newest first: a product view, two page views with
/// dwell, and one event from a metric the digest ignores.
fn events_page() -> Value {
    json!({
        "data": [
            {
                "type": "event",
                "id": "e1",
                "relationships": { "metric": { "data": { "type": "metric", "id": "M-prod" } } },
                "attributes": {
                    "datetime": "2026-02-14T10:00:00Z",
                    "properties": {
                        "product_id": "p-1",
                        "product_name": "Trail Boot",
                        "price": 129.0,
                        "url_path": "/demo/boots/trail",
                        "topic": "boots"
                    }
                }
            },
            {
                "type": "event",
                "id": "e2",
                "relationships": { "metric": { "data": { "type": "metric", "id": "M-page" } } },
                "attributes": {
                    "datetime": "2026-02-14T09:00:00Z",
                    "properties": {
                        "url_path": "/demo/boots",
                        "title": "Boots",
                        "topic": "boots",
                        "dwell_seconds": 20
                    }
                }
            },
            {
                "type": "event",
                "id": "e3",
                "relationships": { "metric": { "data": { "type": "metric", "id": "M-page" } } },
                "attributes": {
                    "datetime": "2026-02-13T09:00:00Z",
                    "properties": {
                        "url_path": "/demo/running",
                        "topic": "running",
                        "dwell_seconds": 10
                    }
                }
            },
            {
                "type": "event",
                "id": "e4",
                "relationships": { "metric": { "data": { "type": "metric", "id": "M-other" } } },
                "attributes": {
                    "datetime": "2026-02-13T08:00:00Z",
                    "properties": {}
                }
            }
        ],
        "included": [
            { "type": "metric", "id": "M-page", "attributes": { "name": "Page Viewed" } },
            { "type": "metric", "id": "M-prod", "attributes": { "name": "Product Viewed" } },
            { "type": "metric", "id": "M-other", "attributes": { "name": "Checkout Started" } }
        ],
        "links": { "next": null }
    })
}

/// Loopback LLM endpoint that always answers with a schema-correct digest.
async fn spawn_stub_ai() -> String {
    let content = json!({
        "headline": "Your week in boots",
        "summary": "You spent most of the week comparing boots.",
        "inferred_topics": [
            { "topic": "boots", "confidence": 0.9, "evidence": "2 pages and 1 product" },
            { "topic": "running", "confidence": 0.7, "evidence": "1 page viewed" },
            { "topic": "outdoor gear", "confidence": 0.6, "evidence": "related browsing" }
        ],
        "recommended_products": [
            { "product_id": "p-1", "product_name": "Trail Boot", "reason": "You viewed this product." },
            { "product_id": null, "product_name": "Waterproof winter boots", "reason": "Matches your boots browsing." },
            { "product_id": null, "product_name": "Wool hiking socks", "reason": "Pairs with the boots you viewed." }
        ]
    });
    let answer = completion(&content);
    let router = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let answer = answer.clone();
            async move { Json(answer) }
        }),
    );
    spawn_stub(router).await
}

fn completion(content: &Value) -> Value {
    json!({
        "choices": [ { "message": { "role": "assistant", "content": content.to_string() } } ]
    })
}

/// Loopback LLM endpoint that violates the digest constraints on the first
/// call (one topic, no products) and answers correctly on the second.
async fn spawn_stub_ai_needing_repair(calls: Arc<AtomicUsize>) -> String {
    let first = json!({
        "headline": "Your week in boots",
        "summary": "Mostly boots.",
        "inferred_topics": [
            { "topic": "boots", "confidence": 0.9, "evidence": "2 pages and 1 product" }
        ],
        "recommended_products": []
    });
    let second = json!({
        "headline": "Your week in boots",
        "summary": "You compared boots and checked a running page.",
        "inferred_topics": [
            { "topic": "boots", "confidence": 0.9, "evidence": "2 pages and 1 product" },
            { "topic": "running", "confidence": 0.7, "evidence": "1 page viewed" },
            { "topic": "outdoor gear", "confidence": 0.6, "evidence": "related browsing" }
        ],
        "recommended_products": [
            { "product_id": "p-1", "product_name": "Trail Boot", "reason": "You viewed this product." },
            { "product_id": null, "product_name": "Waterproof winter boots", "reason": "Matches your boots browsing." },
            { "product_id": null, "product_name": "Wool hiking socks", "reason": "Pairs with the boots you viewed." }
        ]
    });
    let router = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let calls = calls.clone();
            let first = first.clone();
            let second = second.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Json(completion(&first))
                } else {
                    Json(completion(&second))
                }
            }
        }),
    );
    spawn_stub(router).await
}

/// Same violating first answer, but the repair call itself fails.
async fn spawn_stub_ai_failing_repair(calls: Arc<AtomicUsize>) -> String {
    let first = json!({
        "headline": "Your week in boots",
        "summary": "Mostly boots.",
        "inferred_topics": [
            { "topic": "boots", "confidence": 0.9, "evidence": "2 pages and 1 product" }
        ],
        "recommended_products": []
    });
    let router = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let calls = calls.clone();
            let first = first.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    (StatusCode::OK, Json(completion(&first)))
                } else {
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({ "error": "model overloaded" })),
                    )
                }
            }
        }),
    );
    spawn_stub(router).await
}

async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn healthz_reports_revision_and_ai_flag() {
    let app = build_app(test_config("http://127.0.0.1:9"), test_secrets()).unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["api_version"], "0.1.0");
    assert_eq!(body["klaviyo_revision"], "2026-01-15");
    assert_eq!(body["has_klaviyo_key"], true);
    assert_eq!(body["ai_enabled"], false);
}

#[tokio::test]
async fn upsert_returns_existing_profile_on_repeat_calls() {
    let base = spawn_stub_klaviyo().await;
    let app = build_app(test_config(&base), test_secrets()).unwrap();
    let (status, body) = post_json(
        app.clone(),
        "/v1/profiles/upsert",
        json!({ "email": "shopper@example.com" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["profile_id"], "prof-1");

    let (_, again) = post_json(
        app,
        "/v1/profiles/upsert",
        json!({ "email": "shopper@example.com" }),
    )
    .await;
    assert_eq!(again["profile_id"], body["profile_id"]);
}

#[tokio::test]
async fn upsert_creates_profile_on_miss() {
    let base = spawn_stub_klaviyo().await;
    let app = build_app(test_config(&base), test_secrets()).unwrap();
    let (status, body) = post_json(
        app,
        "/v1/profiles/upsert",
        json!({ "email": "missing@example.com", "preferences": { "tier": "demo" } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["profile_id"], "prof-new");
}

#[tokio::test]
async fn blank_email_is_rejected_before_any_upstream_call() {
    let app = build_app(test_config("http://127.0.0.1:9"), test_secrets()).unwrap();
    let (status, body) = post_json(app, "/v1/profiles/upsert", json!({ "email": "   " })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn product_view_requires_product_id() {
    let app = build_app(test_config("http://127.0.0.1:9"), test_secrets()).unwrap();
    let (status, body) = post_json(
        app,
        "/v1/track/product-view",
        json!({ "email": "shopper@example.com", "product_id": "  " }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn page_view_records_event_against_profile() {
    let base = spawn_stub_klaviyo().await;
    let app = build_app(test_config(&base), test_secrets()).unwrap();
    let (status, body) = post_json(
        app,
        "/v1/track/page-view",
        json!({
            "email": "  Shopper@Example.com ",
            "url_path": "/demo/boots",
            "topic": "boots",
            "dwell_seconds": 18.5
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["profile_id"], "prof-1");
    assert_eq!(body["event_id"], "evt-1");
}

#[tokio::test]
async fn digest_without_ai_key_is_deterministic_only() {
    let base = spawn_stub_klaviyo().await;
    let app = build_app(test_config(&base), test_secrets()).unwrap();
    let (status, body) = post_json(
        app,
        "/v1/digest/generate",
        json!({ "email": "shopper@example.com" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["email"], "shopper@example.com");
    assert_eq!(body["ai_used"], false);
    assert_eq!(body["ai_digest"], Value::Null);

    assert_eq!(body["digest"]["stats"]["page_views"], 2);
    assert_eq!(body["digest"]["stats"]["product_views"], 1);
    assert_eq!(body["digest"]["stats"]["total_dwell_seconds"], 30.0);
    assert_eq!(body["digest"]["top_topics"][0]["topic"], "boots");
    assert_eq!(body["digest"]["top_products"][0]["product_id"], "p-1");
    assert_eq!(body["digest"]["top_products"][0]["avg_price"], 129.0);

    // The unclassifiable metric counts as fetched but not as an event.
    assert_eq!(body["meta"]["fetched_events"], 4);
    assert_eq!(body["events"].as_array().unwrap().len(), 3);
    assert_eq!(body["events"][0]["type"], "product_view");
}

#[tokio::test]
async fn digest_with_ai_key_returns_enriched_result() {
    let klaviyo_base = spawn_stub_klaviyo().await;
    let ai_base = spawn_stub_ai().await;
    let mut secrets = test_secrets();
    secrets.openai_api_key = Some("sk-test".to_string());
    secrets.openai_api_base = ai_base;

    let app = build_app(test_config(&klaviyo_base), secrets).unwrap();
    let (status, body) = post_json(
        app,
        "/v1/digest/generate",
        json!({ "email": "shopper@example.com", "days": 7 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ai_used"], true);

    let topics = body["ai_digest"]["inferred_topics"].as_array().unwrap();
    assert!((3..=6).contains(&topics.len()));
    assert!(topics.iter().any(|t| t["topic"] == "boots"));
    for t in topics {
        let confidence = t["confidence"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&confidence));
    }

    let products = body["ai_digest"]["recommended_products"].as_array().unwrap();
    assert!((3..=5).contains(&products.len()));
    assert!(products.iter().any(|p| p["product_id"] == "p-1"));
}

#[tokio::test]
async fn oversized_window_is_rejected_without_upstream_call() {
    // Unbounded day counts would overflow the window arithmetic.
    let app = build_app(test_config("http://127.0.0.1:9"), test_secrets()).unwrap();
    let (status, body) = post_json(
        app,
        "/v1/digest/generate",
        json!({ "email": "shopper@example.com", "days": 4_000_000_000u32 }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn violating_ai_response_triggers_one_repair_call() {
    let klaviyo_base = spawn_stub_klaviyo().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let ai_base = spawn_stub_ai_needing_repair(calls.clone()).await;
    let mut secrets = test_secrets();
    secrets.openai_api_key = Some("sk-test".to_string());
    secrets.openai_api_base = ai_base;

    let app = build_app(test_config(&klaviyo_base), secrets).unwrap();
    let (status, body) = post_json(
        app,
        "/v1/digest/generate",
        json!({ "email": "shopper@example.com" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ai_used"], true);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // The repaired response is the one returned, not the patched first draft.
    let topics = body["ai_digest"]["inferred_topics"].as_array().unwrap();
    assert!((3..=6).contains(&topics.len()));
    assert!(topics.iter().any(|t| t["topic"] == "outdoor gear"));

    let products = body["ai_digest"]["recommended_products"].as_array().unwrap();
    assert!((3..=5).contains(&products.len()));
    assert!(products.iter().any(|p| p["product_id"] == "p-1"));
}

#[tokio::test]
async fn failed_repair_call_falls_back_to_enforced_draft() {
    let klaviyo_base = spawn_stub_klaviyo().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let ai_base = spawn_stub_ai_failing_repair(calls.clone()).await;
    let mut secrets = test_secrets();
    secrets.openai_api_key = Some("sk-test".to_string());
    secrets.openai_api_base = ai_base;

    let app = build_app(test_config(&klaviyo_base), secrets).unwrap();
    let (status, body) = post_json(
        app,
        "/v1/digest/generate",
        json!({ "email": "shopper@example.com" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ai_used"], true);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // The enforced pre-repair draft comes back: the model's topic plus the
    // coverage and filler backstops, never fewer than three.
    let topics = body["ai_digest"]["inferred_topics"].as_array().unwrap();
    assert!((3..=6).contains(&topics.len()));
    assert!(topics.iter().any(|t| t["topic"] == "boots"));
    assert!(topics.iter().any(|t| t["topic"] == "running"));

    let products = body["ai_digest"]["recommended_products"].as_array().unwrap();
    assert!((3..=5).contains(&products.len()));
    assert!(products.iter().any(|p| p["product_id"] == "p-1"));
}

#[tokio::test]
async fn ai_failure_with_key_configured_degrades_to_deterministic_digest() {
    let klaviyo_base = spawn_stub_klaviyo().await;
    let mut secrets = test_secrets();
    secrets.openai_api_key = Some("sk-test".to_string());
    // Nothing listens here, so the AI call fails at transport.
    secrets.openai_api_base = "http://127.0.0.1:9".to_string();

    let app = build_app(test_config(&klaviyo_base), secrets).unwrap();
    let (status, body) = post_json(
        app,
        "/v1/digest/generate",
        json!({ "email": "shopper@example.com" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["ai_used"], false);
    assert_eq!(body["ai_digest"], Value::Null);
    assert_eq!(body["digest"]["top_topics"][0]["topic"], "boots");
}

#[tokio::test]
async fn upstream_failure_surfaces_as_bad_gateway() {
    // Nothing listens on this port, so the profile lookup fails at transport.
    let app = build_app(test_config("http://127.0.0.1:9"), test_secrets()).unwrap();
    let (status, body) = post_json(
        app,
        "/v1/digest/generate",
        json!({ "email": "shopper@example.com" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "upstream.transport");
}
