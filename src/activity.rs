//! The activity executor capability: the narrow interface through which the
//! scheduler consumes external collaborators (scraping API, LLM endpoint).
//! Executors must tolerate retry without duplicate side effects.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::ActivityFailure;
use crate::item::{Stage, WorkItem};

/// Input handed to an executor for one dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityRequest {
    pub item_id: String,
    pub company: String,
    pub policy: String,
    pub timestamp: String,
    pub stage: Stage,
    pub workflow: String,
}

impl ActivityRequest {
    pub fn for_item(item: &WorkItem) -> Self {
        Self {
            item_id: item.id(),
            company: item.key.company.clone(),
            policy: item.key.policy.clone(),
            timestamp: item.key.timestamp.clone(),
            stage: item.stage,
            workflow: item.stage.workflow().to_string(),
        }
    }
}

/// Raw producer output plus the version info the producer declares for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityOutput {
    pub payload: String,
    pub schema_version: String,
    pub prompt_version: String,
    pub is_chunked: bool,
}

pub trait ActivityExecutor {
    async fn execute(&self, req: &ActivityRequest) -> Result<ActivityOutput, ActivityFailure>;
}

// Wire shape returned by both collaborator endpoints.
#[derive(Debug, Deserialize)]
struct ActivityResponse {
    payload: serde_json::Value,
    schema_version: String,
    prompt_version: String,
    #[serde(default)]
    is_chunked: bool,
}

/// HTTP executor routing each stage to its collaborator endpoint.
pub struct HttpActivity {
    client: Client,
    scrape_url: String,
    llm_url: String,
    api_key: String,
}

impl HttpActivity {
    pub fn new(scrape_url: String, llm_url: String, api_key: String) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        Self { client, scrape_url, llm_url, api_key }
    }

    fn endpoint_for(&self, stage: Stage) -> &str {
        match stage.resource() {
            "scrape-api" => &self.scrape_url,
            // Local transforms ride the LLM-side service in this deployment.
            _ => &self.llm_url,
        }
    }
}

impl ActivityExecutor for HttpActivity {
    async fn execute(&self, req: &ActivityRequest) -> Result<ActivityOutput, ActivityFailure> {
        let response = self
            .client
            .post(self.endpoint_for(req.stage))
            .header("x-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ActivityFailure::Timeout
                } else {
                    ActivityFailure::Transient(e.to_string())
                }
            })?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(ActivityFailure::RateLimited { retry_after_ms: retry_after });
        }

        if status.is_server_error() {
            let message = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(ActivityFailure::Transient(format!("{status}: {message}")));
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(ActivityFailure::Fatal(format!("{status}: {message}")));
        }

        let body = response
            .json::<ActivityResponse>()
            .await
            .map_err(|e| ActivityFailure::Validation(format!("malformed activity response: {e}")))?;

        let payload = serde_json::to_string(&body.payload)
            .map_err(|e| ActivityFailure::Validation(e.to_string()))?;

        Ok(ActivityOutput {
            payload,
            schema_version: body.schema_version,
            prompt_version: body.prompt_version,
            is_chunked: body.is_chunked,
        })
    }
}
