use std::collections::HashMap;

use chrono::Utc;
use recap_contracts::NormalizedEvent;
use reqwest::Client;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum KlaviyoError {
    #[error("klaviyo request failed with status {status}")]
    Http { status: u16, body: String },
    #[error("klaviyo returned non-JSON response with status {status}")]
    InvalidJson { status: u16, body: String },
    #[error("klaviyo transport error: {0}")]
    Transport(String),
}

/// Authenticated client for the CRM's JSON:API surface. Every call is a
/// single network round trip; nothing is retried here.
#[derive(Clone)]
pub struct KlaviyoClient {
    client: Client,
    api_base: String,
    private_key: String,
    revision: String,
    page_size: usize,
}

impl KlaviyoClient {
    pub fn new(
        api_base: String,
        private_key: String,
        revision: String,
        page_size: usize,
    ) -> Result<Self, KlaviyoError> {
        let client = Client::builder()
            .build()
            .map_err(|e| KlaviyoError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            private_key,
            revision,
            page_size,
        })
    }

    pub async fn find_profile_id_by_email(
        &self,
        email: &str,
    ) -> Result<Option<String>, KlaviyoError> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/profiles", self.api_base),
            &[
                ("filter", format!("equals(email,\"{email}\")")),
                ("page[size]", "1".to_string()),
            ],
        )
        .map_err(|e| KlaviyoError::Transport(e.to_string()))?;

        let body = self.get_json(url.as_str()).await?;
        Ok(body
            .pointer("/data/0/id")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    pub async fn create_profile(
        &self,
        email: &str,
        properties: &Map<String, Value>,
    ) -> Result<String, KlaviyoError> {
        let body = json!({
            "data": {
                "type": "profile",
                "attributes": {
                    "email": email,
                    "properties": properties,
                }
            }
        });
        let res = self.post_json("/profiles", &body).await?;
        res.pointer("/data/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| KlaviyoError::InvalidJson {
                status: 201,
                body: res.to_string(),
            })
    }

    /// Lookup by exact email, create on miss. Not transactional: two
    /// concurrent first-time calls for the same email can create two
    /// profiles. Accepted limitation.
    pub async fn get_or_create_profile_id(
        &self,
        email: &str,
        properties: &Map<String, Value>,
    ) -> Result<String, KlaviyoError> {
        if let Some(existing) = self.find_profile_id_by_email(email).await? {
            debug!("profile found - email={email}, profile_id={existing}");
            return Ok(existing);
        }
        let created = self.create_profile(email, properties).await?;
        info!("profile created - email={email}, profile_id={created}");
        Ok(created)
    }

    pub async fn create_event(
        &self,
        profile_id: &str,
        metric_name: &str,
        properties: Map<String, Value>,
        time: Option<String>,
        unique_id: Option<String>,
    ) -> Result<Option<String>, KlaviyoError> {
        let body = json!({
            "data": {
                "type": "event",
                "attributes": {
                    "metric": {
                        "data": {
                            "type": "metric",
                            "attributes": { "name": metric_name },
                        }
                    },
                    "profile": {
                        "data": { "type": "profile", "id": profile_id },
                    },
                    "properties": properties,
                    "time": time.unwrap_or_else(|| Utc::now().to_rfc3339()),
                    "unique_id": unique_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                }
            }
        });
        let res = self.post_json("/events", &body).await?;
        Ok(res
            .pointer("/data/id")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Fetch events for one profile since a cutoff, newest first, following
    /// the next-page cursor until exhausted or `max_pages`. Each page's
    /// included metric records resolve metric ids to names before the
    /// records are normalized.
    pub async fn list_recent_events(
        &self,
        profile_id: &str,
        since: &str,
        max_pages: usize,
    ) -> Result<Vec<NormalizedEvent>, KlaviyoError> {
        // Comma in the filter expression is an implicit AND. Metric is not
        // part of the filter because custom metrics may not be filterable.
        let filter = format!("equals(profile_id,\"{profile_id}\"),greater-or-equal(datetime,{since})");
        let first = reqwest::Url::parse_with_params(
            &format!("{}/events", self.api_base),
            &[
                ("filter", filter),
                ("include", "metric".to_string()),
                ("sort", "-datetime".to_string()),
                ("page[size]", self.page_size.to_string()),
            ],
        )
        .map_err(|e| KlaviyoError::Transport(e.to_string()))?;

        let mut out = Vec::new();
        let mut next_url = Some(first.to_string());
        let mut page_count = 0;

        while let Some(url) = next_url {
            if page_count >= max_pages {
                break;
            }
            page_count += 1;

            let page = self.get_json(&url).await?;

            let mut metric_names: HashMap<String, String> = HashMap::new();
            if let Some(included) = page.get("included").and_then(Value::as_array) {
                for inc in included {
                    if inc.get("type").and_then(Value::as_str) != Some("metric") {
                        continue;
                    }
                    let id = inc.get("id").and_then(Value::as_str);
                    let name = inc
                        .pointer("/attributes/name")
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|s| !s.is_empty());
                    if let (Some(id), Some(name)) = (id, name) {
                        metric_names.insert(id.to_string(), name.to_string());
                    }
                }
            }

            if let Some(data) = page.get("data").and_then(Value::as_array) {
                for record in data {
                    out.push(recap_kernel::normalize_event(record, &metric_names));
                }
            }

            next_url = page
                .pointer("/links/next")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        debug!(
            "event fetch completed - profile_id={profile_id}, pages={page_count}, events={}",
            out.len()
        );
        Ok(out)
    }

    async fn get_json(&self, url: &str) -> Result<Value, KlaviyoError> {
        let response = self
            .client
            .get(url)
            .header("Authorization", format!("Klaviyo-API-Key {}", self.private_key))
            .header("revision", &self.revision)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| KlaviyoError::Transport(e.to_string()))?;
        Self::read_json(response).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, KlaviyoError> {
        let response = self
            .client
            .post(format!("{}{path}", self.api_base))
            .header("Authorization", format!("Klaviyo-API-Key {}", self.private_key))
            .header("revision", &self.revision)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| KlaviyoError::Transport(e.to_string()))?;
        Self::read_json(response).await
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, KlaviyoError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| KlaviyoError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(KlaviyoError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&text).map_err(|_| KlaviyoError::InvalidJson {
            status: status.as_u16(),
            body: text,
        })
    }
}
