//! Chat-completion client with transient-error retry.
//!
//! Any endpoint speaking the OpenAI-compatible function-calling shape works;
//! the client holds no endpoint-specific state. Retryable network failures
//! get up to three attempts under exponential backoff (2s, 4s, 8s, capped at
//! 30s). Cancellation aborts in-flight requests and backoff waits and is
//! never retried.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::types::{ChatMessage, ChatRequest, ChatResponse, ToolSpec};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Long overall timeout: reasoning over large tool output can take minutes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Endpoint configuration for the chat client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// One chat completion, retried on transient network failure.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let mut last_err = None;

        for attempt in 0..MAX_ATTEMPTS {
            match self.chat_once(messages, tools, cancel).await {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!(attempt = attempt + 1, "model call succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Err(anyhow!("model call cancelled"));
                    }
                    if !is_retryable_error(&format!("{e:#}")) {
                        return Err(e);
                    }

                    if attempt + 1 < MAX_ATTEMPTS {
                        let backoff = backoff_delay(attempt);
                        tracing::warn!(
                            attempt = attempt + 1,
                            backoff_secs = backoff.as_secs(),
                            "model call failed, retrying: {e:#}"
                        );
                        last_err = Some(e);
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => {
                                return Err(anyhow!("model call cancelled"));
                            }
                        }
                    } else {
                        last_err = Some(e);
                    }
                }
            }
        }

        Err(anyhow!(
            "model call still failing after {MAX_ATTEMPTS} attempts: {:#}",
            last_err.expect("retry loop exits with an error")
        ))
    }

    async fn chat_once(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            tools,
        };

        tracing::debug!(
            messages = messages.len(),
            tools = tools.len(),
            model = %self.config.model,
            "sending chat completion request"
        );

        let request = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body);

        let response = tokio::select! {
            result = request.send() => result.context("chat completion request failed")?,
            _ = cancel.cancelled() => return Err(anyhow!("model call cancelled")),
        };

        let status = response.status();
        let text = tokio::select! {
            result = response.text() => result.context("failed reading chat completion body")?,
            _ = cancel.cancelled() => return Err(anyhow!("model call cancelled")),
        };

        if !status.is_success() {
            tracing::warn!(status = %status, body = %text, "model endpoint returned an error");
            return Err(anyhow!("model endpoint returned {status}: {text}"));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse chat completion response: {text}"))?;

        if let Some(error) = &parsed.error {
            return Err(anyhow!(
                "model endpoint error ({}): {}",
                error.error_type,
                error.message
            ));
        }
        if parsed.choices.is_empty() {
            return Err(anyhow!("model endpoint returned no choices"));
        }

        Ok(parsed)
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt + 1)).min(BACKOFF_CAP)
}

/// Transient network conditions worth another attempt.
pub fn is_retryable_error(message: &str) -> bool {
    const RETRYABLE: &[&str] = &[
        "connection reset",
        "connection refused",
        "timeout",
        "timed out",
        "i/o timeout",
        "no such host",
        "dns error",
        "network is unreachable",
        "broken pipe",
        "eof",
        "connection closed",
        "error sending request",
    ];

    let lower = message.to_lowercase();
    RETRYABLE.iter().any(|token| lower.contains(token))
}
