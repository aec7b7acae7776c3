use recap_contracts::{
    AiDigestResult, CandidateProduct, DigestStats, InferredTopic, RecommendedProduct, TrackedEvent,
};
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

const MIN_TOPICS: usize = 3;
const MAX_TOPICS: usize = 6;
const MIN_PRODUCTS: usize = 3;
const MAX_PRODUCTS: usize = 5;

const COVERAGE_CONFIDENCE: f64 = 0.72;
const BACKFILL_CONFIDENCE: f64 = 0.6;
const FILLER_CONFIDENCE: f64 = 0.55;
const DEFAULT_CONFIDENCE: f64 = 0.65;

const DEFAULT_HEADLINE: &str = "Weekly Digest Overview";
const DEFAULT_SUMMARY: &str = "Here's what stood out this week based on your browsing.";

const FILLER_TOPICS: [&str; 4] = [
    "winter apparel",
    "outdoor gear",
    "footwear",
    "cold weather essentials",
];

const SYSTEM_PROMPT: &str = "You generate a weekly interest digest from browsing events. \
     Return ONLY valid JSON (no markdown, no extra text).";

const RULES: &str = r#"Return ONLY JSON matching EXACTLY:
{
  "headline": string,
  "summary": string,
  "inferred_topics": [
    { "topic": string, "confidence": number, "evidence": string }
  ],
  "recommended_products": [
    { "product_id": string | null, "product_name": string, "reason": string }
  ]
}

Rules:
- Write the digest as a summary of the USER'S activity (avoid marketing copy like "our latest offerings").
- inferred_topics MUST contain 3 to 6 items.
- If candidate_topics are provided, inferred_topics MUST include at least 2 topics from candidate_topics.
- confidence MUST be between 0 and 1.
- recommended_products MUST contain 3 to 5 items.
- If candidate_products count is 3 or more:
  - recommended_products MUST ONLY use those products (product_id cannot be null).
  - Do NOT invent product IDs or product names.
- If candidate_products count is 1 or 2:
  - include those candidate products (with their product_id)
  - you MAY add generic product-type suggestions with product_id = null (do NOT invent SKUs)
- If candidate_products is empty:
  - product_id MUST be null for all recommended_products.
- Reasons should reference browsing evidence (topics/pages viewed), not "reviews" or popularity claims unless supported.
"#;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("llm request failed with status {status}")]
    Http { status: u16, body: String },
    #[error("llm transport error: {0}")]
    Transport(String),
    #[error("llm response carried no completion content")]
    MissingContent,
}

/// Client for the LLM completion API. Constructed only when an API key is
/// configured; absence of the client makes the whole AI stage a no-op.
#[derive(Clone)]
pub struct AiClient {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
    max_events: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ViolationKind {
    TopicCount,
    TopicCoverage,
    ProductCount,
    ProductPolicy,
    MissingHeadline,
    MissingSummary,
}

#[derive(Debug, Clone)]
struct Violation {
    kind: ViolationKind,
    message: String,
}

impl Violation {
    fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Only structural violations against ground truth justify spending the
    /// single repair call; missing headline/summary text is patched locally.
    fn triggers_repair(&self) -> bool {
        matches!(
            self.kind,
            ViolationKind::TopicCount
                | ViolationKind::TopicCoverage
                | ViolationKind::ProductCount
                | ViolationKind::ProductPolicy
        )
    }
}

impl AiClient {
    pub fn new(
        api_base: String,
        api_key: String,
        model: String,
        max_events: usize,
    ) -> Result<Self, AiError> {
        let client = Client::builder()
            .build()
            .map_err(|e| AiError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            model,
            max_events,
        })
    }

    /// Produce an AI digest grounded in the deterministic results.
    ///
    /// Draft -> Sanitized -> Checked -> (Repair -> Sanitized -> Checked)? -> Final.
    /// At most one repair cycle; a failed repair falls back to the enforced
    /// pre-repair result instead of failing the stage.
    pub async fn generate(
        &self,
        email: &str,
        stats: &DigestStats,
        candidate_topics: &[String],
        candidate_products: &[CandidateProduct],
        events: &[TrackedEvent],
    ) -> Result<AiDigestResult, AiError> {
        let candidate_topics = dedup_topics(candidate_topics);
        let candidate_products = dedup_products(candidate_products);
        // Events arrive newest-first from the CRM, so the window of most
        // recent activity is the head of the list.
        let recent: Vec<&TrackedEvent> = events.iter().take(self.max_events).collect();

        let payload = json!({
            "email": email,
            "stats": stats,
            "candidate_topics": candidate_topics,
            "candidate_products": candidate_products,
            "events": recent,
        });

        let raw = self
            .complete(vec![
                json!({"role": "system", "content": SYSTEM_PROMPT}),
                json!({"role": "user", "content": RULES}),
                json!({"role": "user", "content": payload.to_string()}),
            ])
            .await?;

        let draft = parse_draft(&raw);
        let (result, violations) = check(
            sanitize(&draft),
            &candidate_topics,
            &candidate_products,
            events,
        );

        let repairable: Vec<&Violation> =
            violations.iter().filter(|v| v.triggers_repair()).collect();
        if repairable.is_empty() {
            return Ok(result);
        }

        debug!(
            "ai digest needs repair - violations={}",
            repairable.len()
        );
        match self
            .repair(&payload, &repairable, &raw)
            .await
        {
            Ok(repaired_raw) => {
                let repaired_draft = parse_draft(&repaired_raw);
                let (repaired, remaining) = check(
                    sanitize(&repaired_draft),
                    &candidate_topics,
                    &candidate_products,
                    events,
                );
                if remaining.iter().any(|v| v.triggers_repair()) {
                    debug!("ai digest repair left violations; enforcement already patched them");
                }
                Ok(repaired)
            }
            Err(e) => {
                warn!("ai digest repair call failed, keeping enforced draft - {e}");
                Ok(result)
            }
        }
    }

    async fn repair(
        &self,
        payload: &Value,
        violations: &[&Violation],
        previous_raw: &str,
    ) -> Result<String, AiError> {
        let listing: String = violations
            .iter()
            .map(|v| format!("- {}\n", v.message))
            .collect();
        let instruction = format!(
            "Your previous response violated these constraints:\n{listing}\n\
             Previous response JSON:\n{previous_raw}\n\n\
             Return the corrected JSON object, fixing ONLY the listed violations."
        );
        self.complete(vec![
            json!({"role": "system", "content": SYSTEM_PROMPT}),
            json!({"role": "user", "content": RULES}),
            json!({"role": "user", "content": payload.to_string()}),
            json!({"role": "user", "content": instruction}),
        ])
        .await
    }

    async fn complete(&self, messages: Vec<Value>) -> Result<String, AiError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "response_format": { "type": "json_object" },
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AiError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AiError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(AiError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: Value = serde_json::from_str(&text).map_err(|_| AiError::MissingContent)?;
        parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(AiError::MissingContent)
    }
}

/// A model response that is not valid JSON becomes an empty draft; the
/// enforcement pass and the repair call take it from there.
fn parse_draft(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| json!({}))
}

/// Coerce the draft into the expected shape: strings trimmed, malformed
/// entries dropped, confidence clamped, oversized arrays truncated.
fn sanitize(draft: &Value) -> AiDigestResult {
    let headline = string_or_empty(draft.get("headline"));
    let summary = string_or_empty(draft.get("summary"));

    let mut inferred_topics: Vec<InferredTopic> = Vec::new();
    if let Some(items) = draft.get("inferred_topics").and_then(Value::as_array) {
        for item in items {
            let topic = string_or_empty(item.get("topic"));
            if topic.is_empty() {
                continue;
            }
            inferred_topics.push(InferredTopic {
                topic,
                confidence: clamp_confidence(item.get("confidence")),
                evidence: string_or_empty(item.get("evidence")),
            });
        }
    }
    inferred_topics.truncate(MAX_TOPICS);

    let mut recommended_products: Vec<RecommendedProduct> = Vec::new();
    if let Some(items) = draft.get("recommended_products").and_then(Value::as_array) {
        for item in items {
            let product_name = string_or_empty(item.get("product_name"));
            if product_name.is_empty() {
                continue;
            }
            recommended_products.push(RecommendedProduct {
                product_id: item
                    .get("product_id")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                product_name,
                reason: string_or_empty(item.get("reason")),
            });
        }
    }
    recommended_products.truncate(MAX_PRODUCTS);

    AiDigestResult {
        headline,
        summary,
        inferred_topics,
        recommended_products,
    }
}

/// Enforce the structural invariants against ground truth, recording a
/// violation for everything that had to be patched.
fn check(
    mut result: AiDigestResult,
    candidate_topics: &[String],
    candidate_products: &[CandidateProduct],
    events: &[TrackedEvent],
) -> (AiDigestResult, Vec<Violation>) {
    let mut violations = Vec::new();

    enforce_topics(&mut result, candidate_topics, events, &mut violations);
    enforce_products(&mut result, candidate_products, candidate_topics, &mut violations);

    if result.headline.is_empty() {
        violations.push(Violation::new(
            ViolationKind::MissingHeadline,
            "headline is missing",
        ));
        result.headline = DEFAULT_HEADLINE.to_string();
    }
    if result.summary.is_empty() {
        violations.push(Violation::new(
            ViolationKind::MissingSummary,
            "summary is missing",
        ));
        result.summary = DEFAULT_SUMMARY.to_string();
    }

    (result, violations)
}

fn enforce_topics(
    result: &mut AiDigestResult,
    candidate_topics: &[String],
    events: &[TrackedEvent],
    violations: &mut Vec<Violation>,
) {
    let topics = &mut result.inferred_topics;

    if !candidate_topics.is_empty() {
        let covered = topics
            .iter()
            .filter(|t| contains_topic(candidate_topics, &t.topic))
            .count();
        if covered < 2 {
            violations.push(Violation::new(
                ViolationKind::TopicCoverage,
                format!(
                    "inferred_topics must include at least 2 of the candidate topics; only {covered} matched"
                ),
            ));
            let mut covered = covered;
            for candidate in candidate_topics {
                if covered >= 2 || topics.len() >= MAX_TOPICS {
                    break;
                }
                if topics.iter().any(|t| t.topic.eq_ignore_ascii_case(candidate)) {
                    continue;
                }
                topics.push(InferredTopic {
                    topic: candidate.clone(),
                    confidence: COVERAGE_CONFIDENCE,
                    evidence: "Added from deterministic top topics to ensure coverage."
                        .to_string(),
                });
                covered += 1;
            }
        }
    }

    if topics.len() < MIN_TOPICS {
        violations.push(Violation::new(
            ViolationKind::TopicCount,
            format!(
                "inferred_topics must contain {MIN_TOPICS} to {MAX_TOPICS} items; got {}",
                topics.len()
            ),
        ));
        for inferred in recap_kernel::backfill_topics(events) {
            if topics.len() >= MIN_TOPICS {
                break;
            }
            if topics.iter().any(|t| t.topic.eq_ignore_ascii_case(&inferred)) {
                continue;
            }
            topics.push(InferredTopic {
                topic: inferred,
                confidence: BACKFILL_CONFIDENCE,
                evidence: "Inferred from recent browsing activity.".to_string(),
            });
        }
        for filler in FILLER_TOPICS {
            if topics.len() >= MIN_TOPICS {
                break;
            }
            if topics.iter().any(|t| t.topic.eq_ignore_ascii_case(filler)) {
                continue;
            }
            topics.push(InferredTopic {
                topic: filler.to_string(),
                confidence: FILLER_CONFIDENCE,
                evidence: "Fallback topic to ensure digest completeness.".to_string(),
            });
        }
    }

    topics.truncate(MAX_TOPICS);
}

fn enforce_products(
    result: &mut AiDigestResult,
    candidates: &[CandidateProduct],
    candidate_topics: &[String],
    violations: &mut Vec<Violation>,
) {
    let recs = &mut result.recommended_products;

    if candidates.len() >= MIN_PRODUCTS {
        // Enough real products: recommendations must be a subset of them.
        let before = recs.len();
        recs.retain(|r| {
            r.product_id
                .as_deref()
                .map(|id| candidates.iter().any(|c| c.product_id == id))
                .unwrap_or(false)
        });
        if recs.len() != before {
            violations.push(Violation::new(
                ViolationKind::ProductPolicy,
                "recommended_products must only reference candidate products; invented entries were dropped",
            ));
        }
        if recs.len() < MIN_PRODUCTS {
            violations.push(Violation::new(
                ViolationKind::ProductCount,
                format!(
                    "recommended_products must contain {MIN_PRODUCTS} to {MAX_PRODUCTS} items; got {}",
                    recs.len()
                ),
            ));
            for candidate in candidates {
                if recs.len() >= MIN_PRODUCTS {
                    break;
                }
                if recs
                    .iter()
                    .any(|r| r.product_id.as_deref() == Some(candidate.product_id.as_str()))
                {
                    continue;
                }
                recs.push(RecommendedProduct {
                    product_id: Some(candidate.product_id.clone()),
                    product_name: candidate.product_name.clone(),
                    reason: "Added from known viewed products to ensure recommendations."
                        .to_string(),
                });
            }
        }
        recs.truncate(MAX_PRODUCTS);
        return;
    }

    if !candidates.is_empty() {
        // 1-2 real products: all of them must appear; unknown ids become
        // generic id-less suggestions instead of invented SKUs.
        let mut nulled = false;
        for rec in recs.iter_mut() {
            if let Some(id) = rec.product_id.as_deref() {
                if !candidates.iter().any(|c| c.product_id == id) {
                    rec.product_id = None;
                    nulled = true;
                }
            }
        }
        if nulled {
            violations.push(Violation::new(
                ViolationKind::ProductPolicy,
                "recommended_products referenced product ids outside the candidate set; ids were nulled",
            ));
        }

        let mut missing = false;
        for candidate in candidates {
            if recs
                .iter()
                .any(|r| r.product_id.as_deref() == Some(candidate.product_id.as_str()))
            {
                continue;
            }
            missing = true;
            recs.push(RecommendedProduct {
                product_id: Some(candidate.product_id.clone()),
                product_name: candidate.product_name.clone(),
                reason: "You viewed this product (or closely related content) this week."
                    .to_string(),
            });
        }
        if missing {
            violations.push(Violation::new(
                ViolationKind::ProductPolicy,
                "recommended_products must include every candidate product",
            ));
        }

        // Appending candidates may have pushed past the cap; shed id-less
        // generics before touching candidate entries.
        while recs.len() > MAX_PRODUCTS {
            if let Some(idx) = recs.iter().rposition(|r| r.product_id.is_none()) {
                recs.remove(idx);
            } else {
                recs.pop();
            }
        }

        if recs.len() < MIN_PRODUCTS {
            violations.push(Violation::new(
                ViolationKind::ProductCount,
                format!(
                    "recommended_products must contain {MIN_PRODUCTS} to {MAX_PRODUCTS} items; got {}",
                    recs.len()
                ),
            ));
            for name in generic_suggestions(candidate_topics) {
                if recs.len() >= MIN_PRODUCTS {
                    break;
                }
                if recs
                    .iter()
                    .any(|r| r.product_name.eq_ignore_ascii_case(&name))
                {
                    continue;
                }
                recs.push(RecommendedProduct {
                    product_id: None,
                    product_name: name,
                    reason: "Suggested based on your top topics and browsing patterns this week."
                        .to_string(),
                });
            }
            while recs.len() < MIN_PRODUCTS {
                recs.push(RecommendedProduct {
                    product_id: None,
                    product_name: "Suggested product type".to_string(),
                    reason: "Fallback suggestion to ensure a complete weekly digest.".to_string(),
                });
            }
        }
        return;
    }

    // No candidates at all: nothing real to recommend, so every id is null.
    let mut nulled = false;
    for rec in recs.iter_mut() {
        if rec.product_id.take().is_some() {
            nulled = true;
        }
    }
    if nulled {
        violations.push(Violation::new(
            ViolationKind::ProductPolicy,
            "no candidate products exist; product ids must all be null",
        ));
    }
    if recs.len() < MIN_PRODUCTS {
        violations.push(Violation::new(
            ViolationKind::ProductCount,
            format!(
                "recommended_products must contain {MIN_PRODUCTS} to {MAX_PRODUCTS} items; got {}",
                recs.len()
            ),
        ));
        while recs.len() < MIN_PRODUCTS {
            recs.push(RecommendedProduct {
                product_id: None,
                product_name: "Suggested product type".to_string(),
                reason: "Fallback suggestion (no viewed products available).".to_string(),
            });
        }
    }
    recs.truncate(MAX_PRODUCTS);
}

fn generic_suggestions(candidate_topics: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for topic in candidate_topics {
        let names: &[&str] = match topic.to_lowercase().as_str() {
            "boots" => &["All-terrain hiking boots", "Waterproof winter boots"],
            "jackets" => &["Insulated winter jacket", "Lightweight rain shell"],
            "snow" => &["Thermal base layer", "Insulated gloves"],
            "running" => &["Weatherproof running shoes", "Moisture-wicking socks"],
            _ => &[],
        };
        for name in names {
            if !out.iter().any(|have| have.eq_ignore_ascii_case(name)) {
                out.push(name.to_string());
            }
        }
    }
    for name in ["Cold-weather essentials bundle", "Winter accessories kit"] {
        if !out.iter().any(|have| have.eq_ignore_ascii_case(name)) {
            out.push(name.to_string());
        }
    }
    out
}

fn dedup_topics(topics: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for topic in topics {
        let t = topic.trim();
        if t.is_empty() {
            continue;
        }
        if !out.iter().any(|have| have.eq_ignore_ascii_case(t)) {
            out.push(t.to_string());
        }
    }
    out
}

fn dedup_products(products: &[CandidateProduct]) -> Vec<CandidateProduct> {
    let mut out: Vec<CandidateProduct> = Vec::new();
    for product in products {
        if product.product_id.trim().is_empty() || product.product_name.trim().is_empty() {
            continue;
        }
        if !out.iter().any(|have| have.product_id == product.product_id) {
            out.push(product.clone());
        }
    }
    out
}

fn contains_topic(candidates: &[String], topic: &str) -> bool {
    candidates.iter().any(|c| c.eq_ignore_ascii_case(topic))
}

fn string_or_empty(v: Option<&Value>) -> String {
    v.and_then(Value::as_str).unwrap_or("").trim().to_string()
}

fn clamp_confidence(v: Option<&Value>) -> f64 {
    match v.and_then(Value::as_f64) {
        Some(n) if n.is_finite() => n.clamp(0.0, 1.0),
        _ => DEFAULT_CONFIDENCE,
    }
}
