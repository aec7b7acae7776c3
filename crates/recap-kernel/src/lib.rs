use std::collections::HashMap;

use recap_contracts::{
    DigestPeriod, DigestProduct, DigestStats, DigestTopic, NormalizedEvent, TrackedEvent,
    WeeklyDigest, METRIC_PAGE_VIEWED, METRIC_PRODUCT_VIEWED,
};
use serde_json::{Map, Value};

const TOP_TOPICS: usize = 6;
const TOP_PRODUCTS: usize = 8;
const UNKNOWN_TOPIC: &str = "unknown";

/// Dwell time contributes at most this many points to a topic score so one
/// long session cannot dominate the ranking.
const DWELL_SCORE_CAP: f64 = 20.0;

/// Path segments that name site structure rather than a topic.
const STRUCTURAL_SEGMENTS: [&str; 9] = [
    "demo",
    "category",
    "collection",
    "collections",
    "product",
    "products",
    "content",
    "pages",
    "api",
];

/// Normalize one raw CRM event record into the uniform internal shape.
///
/// Total and pure: malformed input degrades to defaults, never errors.
/// Resolution order per field:
/// - metric name: included metric record's name -> relationship id as a
///   literal name -> "Unknown Metric"
/// - datetime: `attributes.datetime` -> `attributes.timestamp` -> None
/// - properties: `attributes.properties` -> `attributes.event_properties` -> {}
pub fn normalize_event(raw: &Value, metric_names: &HashMap<String, String>) -> NormalizedEvent {
    let metric_id = raw
        .pointer("/relationships/metric/data/id")
        .and_then(Value::as_str);

    let metric_name = metric_id
        .and_then(|id| metric_names.get(id).map(String::as_str))
        .or(metric_id)
        .unwrap_or("Unknown Metric")
        .to_string();

    let datetime = raw
        .pointer("/attributes/datetime")
        .and_then(Value::as_str)
        .or_else(|| raw.pointer("/attributes/timestamp").and_then(Value::as_str))
        .map(str::to_string);

    let properties = raw
        .pointer("/attributes/properties")
        .and_then(Value::as_object)
        .or_else(|| {
            raw.pointer("/attributes/event_properties")
                .and_then(Value::as_object)
        })
        .cloned()
        .unwrap_or_else(Map::new);

    NormalizedEvent {
        datetime,
        metric_name,
        properties,
    }
}

/// Classify a normalized event into the tagged union the digest consumes.
/// Metrics other than "Page Viewed" / "Product Viewed" are dropped here.
pub fn classify(event: &NormalizedEvent) -> Option<TrackedEvent> {
    let props = &event.properties;
    match event.metric_name.as_str() {
        METRIC_PAGE_VIEWED => Some(TrackedEvent::PageView {
            ts: event.datetime.clone(),
            url_path: prop_string(props, "url_path"),
            title: prop_string(props, "title"),
            topic: prop_string(props, "topic"),
            dwell_seconds: props.get("dwell_seconds").and_then(number),
        }),
        METRIC_PRODUCT_VIEWED => Some(TrackedEvent::ProductView {
            ts: event.datetime.clone(),
            url_path: prop_string(props, "url_path"),
            title: prop_string(props, "title"),
            topic: prop_string(props, "topic"),
            product_id: prop_string(props, "product_id"),
            product_name: prop_string(props, "product_name"),
            price: props.get("price").and_then(number),
        }),
        _ => None,
    }
}

/// Aggregate a window of tracked events into the deterministic weekly digest.
/// Reads no clock and no randomness: identical input yields identical output.
/// Equal-score topics and equal-view products keep first-seen order.
pub fn build_digest(since: &str, until: &str, events: &[TrackedEvent]) -> WeeklyDigest {
    let mut page_views: u64 = 0;
    let mut product_views: u64 = 0;
    let mut total_dwell_seconds: f64 = 0.0;

    let mut topics: Vec<DigestTopic> = Vec::new();
    let mut products: Vec<ProductAcc> = Vec::new();

    for event in events {
        let topic_key = infer_topic(event.topic(), event.url_path());
        let topic = topic_entry(&mut topics, topic_key);

        match event {
            TrackedEvent::PageView { dwell_seconds, .. } => {
                page_views += 1;
                topic.page_views += 1;
                if let Some(dwell) = dwell_seconds {
                    total_dwell_seconds += dwell;
                    topic.dwell_seconds += dwell;
                }
            }
            TrackedEvent::ProductView {
                ts,
                product_id,
                product_name,
                price,
                ..
            } => {
                product_views += 1;
                topic.product_views += 1;

                if let Some(id) = product_id {
                    let acc = product_entry(&mut products, id);
                    acc.views += 1;
                    if ts.is_some() {
                        acc.last_seen = ts.clone();
                    }
                    acc.product_name = product_name
                        .clone()
                        .unwrap_or_else(|| "Unknown Product".to_string());
                    if let Some(p) = price {
                        acc.price_sum += p;
                        acc.price_count += 1;
                    }
                }
            }
        }
    }

    let mut top_topics: Vec<DigestTopic> = topics
        .into_iter()
        .filter(|t| t.topic != UNKNOWN_TOPIC)
        .map(|mut t| {
            t.score = t.product_views as f64 * 3.0
                + t.page_views as f64
                + (t.dwell_seconds / 10.0).min(DWELL_SCORE_CAP);
            t
        })
        .collect();
    top_topics.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    top_topics.truncate(TOP_TOPICS);

    let mut top_products: Vec<DigestProduct> = products
        .into_iter()
        .map(|acc| DigestProduct {
            product_id: acc.product_id,
            product_name: acc.product_name,
            views: acc.views,
            last_seen: acc.last_seen,
            avg_price: if acc.price_count > 0 {
                Some(acc.price_sum / acc.price_count as f64)
            } else {
                None
            },
        })
        .collect();
    top_products.sort_by(|a, b| b.views.cmp(&a.views));
    top_products.truncate(TOP_PRODUCTS);

    let narrative = compose_narrative(page_views, product_views, &top_topics, &top_products);

    WeeklyDigest {
        period: DigestPeriod {
            since: since.to_string(),
            until: until.to_string(),
        },
        stats: DigestStats {
            page_views,
            product_views,
            total_dwell_seconds,
        },
        top_topics,
        top_products,
        narrative,
    }
}

/// Derive the topic key for one event: explicit non-empty `topic` property,
/// else the URL-path segment following a structural marker, else "unknown".
/// Keys are lower-cased.
pub fn infer_topic(topic: Option<&str>, url_path: Option<&str>) -> String {
    if let Some(t) = topic {
        let t = t.trim();
        if !t.is_empty() {
            return t.to_lowercase();
        }
    }
    if let Some(path) = url_path {
        if let Some(seg) = topic_segment(path) {
            return seg;
        }
    }
    UNKNOWN_TOPIC.to_string()
}

/// Infer candidate topics from raw events for backfilling a short AI topic
/// list. Order-preserving, lower-cased, deduplicated. Chain per event:
/// explicit topic -> first non-structural, non-numeric URL path segment ->
/// short title text (<= 40 chars).
pub fn backfill_topics(events: &[TrackedEvent]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for event in events {
        let candidate = explicit_topic(event.topic())
            .or_else(|| event.url_path().and_then(path_topic_candidate))
            .or_else(|| event.title().and_then(title_topic_candidate));
        if let Some(c) = candidate {
            if !out.iter().any(|have| have == &c) {
                out.push(c);
            }
        }
    }
    out
}

struct ProductAcc {
    product_id: String,
    product_name: String,
    views: u64,
    last_seen: Option<String>,
    price_sum: f64,
    price_count: u64,
}

fn topic_entry<'a>(topics: &'a mut Vec<DigestTopic>, key: String) -> &'a mut DigestTopic {
    if let Some(idx) = topics.iter().position(|t| t.topic == key) {
        return &mut topics[idx];
    }
    topics.push(DigestTopic {
        topic: key,
        score: 0.0,
        page_views: 0,
        product_views: 0,
        dwell_seconds: 0.0,
    });
    topics.last_mut().expect("just pushed")
}

fn product_entry<'a>(products: &'a mut Vec<ProductAcc>, id: &str) -> &'a mut ProductAcc {
    if let Some(idx) = products.iter().position(|p| p.product_id == id) {
        return &mut products[idx];
    }
    products.push(ProductAcc {
        product_id: id.to_string(),
        product_name: "Unknown Product".to_string(),
        views: 0,
        last_seen: None,
        price_sum: 0.0,
        price_count: 0,
    });
    products.last_mut().expect("just pushed")
}

fn compose_narrative(
    page_views: u64,
    product_views: u64,
    top_topics: &[DigestTopic],
    top_products: &[DigestProduct],
) -> String {
    let topic_line = if top_topics.is_empty() {
        "no clear topics yet".to_string()
    } else {
        top_topics
            .iter()
            .take(3)
            .map(|t| t.topic.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let product_line = if top_products.is_empty() {
        "no products yet".to_string()
    } else {
        top_products
            .iter()
            .take(3)
            .map(|p| p.product_name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "In the last week, you showed interest in {topic_line}. \
         You viewed {page_views} pages and {product_views} products. \
         Top products: {product_line}."
    )
}

fn prop_string(props: &Map<String, Value>, key: &str) -> Option<String> {
    props
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Accept numbers as JSON numbers or numeric strings; reject non-finite.
fn number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// The segment immediately following /demo/, /category/, /collection(s)/ in
/// a URL path, separators normalized to spaces. `/demo/boots` -> "boots".
fn topic_segment(path: &str) -> Option<String> {
    let lowered = path.to_lowercase();
    let segments: Vec<&str> = lowered.split('/').filter(|s| !s.is_empty()).collect();
    for (idx, seg) in segments.iter().enumerate() {
        if matches!(*seg, "demo" | "category" | "collection" | "collections") {
            if let Some(next) = segments.get(idx + 1) {
                let cleaned = clean_segment(next);
                if !cleaned.is_empty() {
                    return Some(cleaned);
                }
            }
        }
    }
    None
}

fn clean_segment(seg: &str) -> String {
    let end = seg.find(['?', '#']).unwrap_or(seg.len());
    seg[..end].replace(['-', '_'], " ").trim().to_string()
}

fn explicit_topic(topic: Option<&str>) -> Option<String> {
    let t = topic?.trim().to_lowercase();
    if t.is_empty() || t == UNKNOWN_TOPIC {
        return None;
    }
    Some(t)
}

fn path_topic_candidate(path: &str) -> Option<String> {
    let lowered = path.to_lowercase();
    for seg in lowered.split('/').filter(|s| !s.is_empty()) {
        let cleaned = clean_segment(seg);
        if cleaned.is_empty()
            || STRUCTURAL_SEGMENTS.contains(&cleaned.as_str())
            || numeric_heavy(&cleaned)
        {
            continue;
        }
        return Some(cleaned);
    }
    None
}

fn title_topic_candidate(title: &str) -> Option<String> {
    let t = title.trim();
    if t.is_empty() || t.chars().count() > 40 {
        return None;
    }
    Some(t.to_lowercase())
}

/// A segment where digits make up half or more of the characters is an id,
/// not a topic.
fn numeric_heavy(seg: &str) -> bool {
    let total = seg.chars().filter(|c| !c.is_whitespace()).count();
    if total == 0 {
        return true;
    }
    let digits = seg.chars().filter(|c| c.is_ascii_digit()).count();
    digits * 2 >= total
}
