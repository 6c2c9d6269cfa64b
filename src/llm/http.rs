//! OpenAI-compatible chat completions provider over HTTP.
//!
//! One implementation covers every hosted vendor in the default config;
//! vendor-specific wire formats beyond this shape stay out of scope.

use crate::llm::{classify_status, Completion, FailureKind, LlmFailure, LlmRequest, Provider};
use crate::types::TokenUsage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// HTTP-backed provider for one vendor account.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    name: String,
    base_url: String,
    api_key_env: String,
    http: reqwest::Client,
}

// -- Wire types --------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [crate::llm::Message],
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [serde_json::Value]>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl HttpProvider {
    pub fn new(name: &str, base_url: &str, api_key_env: &str, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key_env: api_key_env.to_string(),
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    fn api_key(&self) -> Option<String> {
        if self.api_key_env.is_empty() {
            return Some(String::new());
        }
        std::env::var(&self.api_key_env).ok().filter(|v| !v.is_empty())
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn available(&self) -> bool {
        !self.base_url.is_empty() && self.api_key().is_some()
    }

    async fn complete(
        &self,
        model: &str,
        request: &LlmRequest,
    ) -> Result<Completion, LlmFailure> {
        let Some(key) = self.api_key() else {
            return Err(LlmFailure::new(
                FailureKind::Auth,
                &self.name,
                format!("No credential in ${}", self.api_key_env),
            ));
        };

        let url = format!("{}/chat/completions", self.base_url);
        let payload = ChatRequest {
            model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: 0.7,
            stop: request.stop.as_deref(),
            tools: request.tools.as_deref(),
        };

        debug!("LLM request: provider={} model={}", self.name, model);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                LlmFailure::new(FailureKind::Network, &self.name, e.to_string())
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let kind = classify_status(status.as_u16());
            return Err(LlmFailure::new(
                kind,
                &self.name,
                format!("HTTP {status}: {}", truncate(&body, 300)),
            ));
        }

        let body: ChatResponse = resp.json().await.map_err(|e| {
            LlmFailure::new(FailureKind::Parse, &self.name, e.to_string())
        })?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                LlmFailure::new(FailureKind::Parse, &self.name, "Empty completion")
            })?;

        let usage = body
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(Completion { content, usage })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
