//! HTTP completion service client
//!
//! Talks JSON to the completion service:
//! - `POST {base}/generate` for single turns
//! - `POST {base}/generate_multi_llm` for round-robin conversations
//!
//! 429, 5xx, timeouts and connection failures are retried with exponential
//! backoff; any other non-success status fails at once.

use std::time::Duration;

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::CompletionSettings;
use crate::error::{Error, Result};
use crate::version;

use super::traits::{CompletionBackend, CompletionRequest, ConversationTurn, RoundRobinRequest};

/// Reply text when the service answers 200 without a `response` field
pub const NO_RESPONSE_TEXT: &str = "No response from LLM";

const GENERATE_PATH: &str = "generate";
const ROUND_ROBIN_PATH: &str = "generate_multi_llm";

/// HTTP client for the completion service
pub struct HttpCompletionBackend {
    client: Client,
    base_url: String,
    timeout: Duration,
    multi_party_timeout: Duration,
    max_retries: u32,
    initial_retry_delay: Duration,
    total_requests: RwLock<u64>,
}

impl HttpCompletionBackend {
    pub fn new(settings: &CompletionSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(version::build_info().user_agent())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let base_url = settings.base_url.trim_end_matches('/').to_string();

        info!(
            base_url = %base_url,
            timeout_secs = settings.timeout_secs,
            multi_party_timeout_secs = settings.multi_party_timeout_secs,
            "Completion client created"
        );

        Ok(Self {
            client,
            base_url,
            timeout: settings.timeout(),
            multi_party_timeout: settings.multi_party_timeout(),
            max_retries: settings.max_retries,
            initial_retry_delay: Duration::from_millis(500),
            total_requests: RwLock::new(0),
        })
    }

    /// Override the first retry delay
    pub fn with_initial_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = delay;
        self
    }

    /// Successful requests since creation
    pub fn total_requests(&self) -> u64 {
        *self.total_requests.read()
    }

    /// POST a JSON body, retrying transient failures
    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, path);

        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_retry_delay,
            max_interval: Duration::from_secs(8),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            match self.post_once(&url, body, timeout).await {
                Ok(value) => {
                    let total = {
                        let mut total = self.total_requests.write();
                        *total += 1;
                        *total
                    };
                    debug!(url = %url, attempt, total_requests = total, "Completion request succeeded");
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = backoff.next_backoff().unwrap_or(self.initial_retry_delay);
                    warn!(
                        url = %url,
                        attempt,
                        ?delay,
                        error = %e,
                        "Retryable completion error"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_once<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<Value> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| Error::upstream_unreadable(format!("response is not JSON: {}", e)))
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> Error {
    if e.is_timeout() {
        Error::UpstreamTimeout {
            timeout_secs: timeout.as_secs(),
        }
    } else {
        Error::Upstream(e.to_string())
    }
}

/// Pull the answer text out of a `/generate` body
fn response_text(body: &Value) -> String {
    match body.get("response") {
        Some(Value::String(text)) => text.clone(),
        None | Some(Value::Null) => NO_RESPONSE_TEXT.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Pull the turn list out of a `/generate_multi_llm` body
fn conversation_turns(body: Value) -> Result<Vec<ConversationTurn>> {
    let Value::Object(mut fields) = body else {
        return Err(Error::upstream_malformed("response is not an object"));
    };

    match fields.remove("conversation") {
        Some(list @ Value::Array(_)) => serde_json::from_value(list).map_err(|e| {
            Error::upstream_malformed(format!("conversation entries must be {{persona, response}}: {}", e))
        }),
        Some(_) => Err(Error::upstream_malformed("conversation is not a list")),
        None => Err(Error::upstream_malformed("conversation field missing")),
    }
}

#[async_trait]
impl CompletionBackend for HttpCompletionBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        debug!(persona = %request.persona_name, "Requesting single-turn completion");
        let body = self.post(GENERATE_PATH, request, self.timeout).await?;
        Ok(response_text(&body))
    }

    async fn round_robin(&self, request: &RoundRobinRequest) -> Result<Vec<ConversationTurn>> {
        debug!(
            personas = request.selected_personas.len(),
            iterations = request.iterations,
            "Requesting round-robin conversation"
        );
        // A body that is not JSON cannot be a conversation either
        let body = match self.post(ROUND_ROBIN_PATH, request, self.multi_party_timeout).await {
            Err(Error::UpstreamUnreadable { message }) => {
                return Err(Error::upstream_malformed(message))
            }
            other => other?,
        };
        conversation_turns(body)
    }
}
