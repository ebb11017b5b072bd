//! Request execution pipeline.
//!
//! One `execute()` call renders a templated request, issues it with a
//! bounded retry policy, and captures the outcome as a [`RequestResult`]
//! whether the attempt succeeded, failed with an HTTP status, or never
//! produced a response at all. Token usage is parsed from the response
//! body across the two reply schemas LLM providers use.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::EndpointProfile;
use crate::errors::FailureKind;
use crate::prompts::PromptSet;
use crate::utils::unix_now;

/// Maximum HTTP attempts for a single execution, including the first.
const MAX_ATTEMPTS: u32 = 3;

/// Outcome of a single execution (one HTTP call plus its retries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResult {
    /// Wall-clock issue time, seconds since the Unix epoch
    pub timestamp: f64,

    /// Prompt text sent with the request
    pub prompt: String,

    /// Seconds from attempt start to body read (or failure)
    pub response_time: f64,

    /// HTTP status code; 0 means no response was received
    pub status_code: u16,

    /// True iff 200 <= status < 300
    pub success: bool,

    /// Full response body; dropped at persistence time
    pub response_content: String,

    /// Description of the failure, when no response was received
    pub error_message: Option<String>,

    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,

    /// Response body length in bytes
    pub content_length: u64,
}

impl RequestResult {
    /// Outcome for an execution that exhausted its retries or failed
    /// before the first attempt.
    pub fn failed(timestamp: f64, prompt: String, error: String) -> Self {
        Self {
            timestamp,
            prompt,
            response_time: unix_now() - timestamp,
            status_code: 0,
            success: false,
            response_content: String::new(),
            error_message: Some(error),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            content_length: 0,
        }
    }

    /// Placeholder outcome for a task that died without producing one
    /// (e.g. a panicked worker). Keeps stage cardinality intact.
    pub fn synthesized(error: String) -> Self {
        Self {
            timestamp: unix_now(),
            prompt: String::new(),
            response_time: 0.0,
            status_code: 0,
            success: false,
            response_content: String::new(),
            error_message: Some(error),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            content_length: 0,
        }
    }
}

/// Executes templated requests against one endpoint profile.
pub struct RequestExecutor {
    client: reqwest::Client,
    profile: EndpointProfile,
    prompts: Arc<PromptSet>,
    endpoint: String,
    params: HashMap<String, String>,
    timeout: Duration,
}

impl RequestExecutor {
    /// Create an executor bound to one profile, prompt set and endpoint
    /// kind for the lifetime of a session.
    pub fn new(
        profile: EndpointProfile,
        prompts: Arc<PromptSet>,
        endpoint: impl Into<String>,
        params: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .build()?;

        Ok(Self {
            client,
            profile,
            prompts,
            endpoint: endpoint.into(),
            params,
            timeout,
        })
    }

    /// Run one execution: draw a prompt, render the request, POST it with
    /// up to [`MAX_ATTEMPTS`] attempts and exponential backoff between
    /// them, and capture the outcome.
    ///
    /// A non-2xx response is a final outcome, never retried; only
    /// transport-level failures (connect, timeout, body read) trigger a
    /// retry. This never returns an error: every failure mode is encoded
    /// in the returned [`RequestResult`].
    pub async fn execute(&self) -> RequestResult {
        let timestamp = unix_now();
        let prompt = self.prompts.next();

        let rendered = match self.profile.render(&self.endpoint, &prompt, &self.params) {
            Ok(rendered) => rendered,
            Err(e) => {
                error!(error = %e, "Failed to render request");
                return RequestResult::failed(timestamp, prompt, e.to_string());
            }
        };

        let headers = match build_header_map(&rendered.headers) {
            Ok(headers) => headers,
            Err(e) => {
                error!(error = %e, "Failed to build request headers");
                return RequestResult::failed(timestamp, prompt, e);
            }
        };

        let start = Instant::now();
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            let send_result = self
                .client
                .post(&rendered.url)
                .headers(headers.clone())
                .json(&rendered.body)
                .timeout(self.timeout)
                .send()
                .await;

            match send_result {
                Ok(response) => {
                    let status = response.status().as_u16();

                    match response.text().await {
                        Ok(content) => {
                            let response_time = start.elapsed().as_secs_f64();
                            let success = (200..300).contains(&status);
                            let (input_tokens, output_tokens, total_tokens) =
                                extract_token_usage(&content);

                            if !success {
                                debug!(
                                    status = status,
                                    url = %rendered.url,
                                    "Request completed with non-success status"
                                );
                            }

                            return RequestResult {
                                timestamp,
                                prompt,
                                response_time,
                                status_code: status,
                                success,
                                content_length: content.len() as u64,
                                response_content: content,
                                error_message: None,
                                input_tokens,
                                output_tokens,
                                total_tokens,
                            };
                        }
                        Err(e) => {
                            warn!(
                                attempt = attempt,
                                kind = %FailureKind::from_reqwest_error(&e),
                                error = %e,
                                "Failed to read response body"
                            );
                            last_error = e.to_string();
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        kind = %FailureKind::from_reqwest_error(&e),
                        error = %e,
                        "Request attempt failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }

        error!(error = %last_error, url = %rendered.url, "Request failed after all attempts");
        RequestResult::failed(timestamp, prompt, last_error)
    }
}

/// Backoff before the next attempt after `attempt` failures: 1s, 2s, 4s,
/// ... clamped to [1s, 10s].
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64 << (attempt.saturating_sub(1)).min(4);
    Duration::from_secs(secs.clamp(1, 10))
}

/// Converts rendered header strings to a reqwest header map.
fn build_header_map(headers: &IndexMap<String, String>) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        let header_name = HeaderName::from_str(name)
            .map_err(|e| format!("Invalid header name '{}': {}", name, e))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| format!("Invalid value for header '{}': {}", name, e))?;
        map.insert(header_name, header_value);
    }

    Ok(map)
}

/// Extracts `(input, output, total)` token counts from a response body.
///
/// Two reply schemas are recognized under a top-level `usage` object:
/// `prompt_tokens`/`completion_tokens`/`total_tokens`, and
/// `input_tokens`/`output_tokens` (total derived by summing). Anything
/// else, including unparseable bodies, yields zeros; a missing count is
/// not an error.
pub fn extract_token_usage(body: &str) -> (u64, u64, u64) {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return (0, 0, 0);
    };
    let Some(usage) = parsed.get("usage") else {
        return (0, 0, 0);
    };

    if usage.get("prompt_tokens").is_some() {
        let input = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
        let output = usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let total = usage.get("total_tokens").and_then(Value::as_u64).unwrap_or(0);
        (input, output, total)
    } else if usage.get("input_tokens").is_some() {
        let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
        let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
        (input, output, input + output)
    } else {
        (0, 0, 0)
    }
}
