//! LLM provider abstraction: request/reply contract and failure taxonomy.

pub mod http;
pub mod local;
pub mod router;

pub use http::HttpProvider;
pub use local::LocalProvider;
pub use router::LlmRouter;

use crate::types::{Tier, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One message in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A routed completion request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub tier: Tier,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub stop: Option<Vec<String>>,
    /// Function/tool declarations, passed through verbatim when present.
    pub tools: Option<Vec<serde_json::Value>>,
}

impl LlmRequest {
    pub fn new(tier: Tier, messages: Vec<Message>, max_tokens: u32) -> Self {
        Self {
            tier,
            messages,
            max_tokens,
            stop: None,
            tools: None,
        }
    }

    /// Rough input size for cost estimation: 4 chars ~ 1 token.
    pub fn estimated_input_tokens(&self) -> u32 {
        let chars: usize = self.messages.iter().map(|m| m.content.chars().count()).sum();
        (chars / 4) as u32
    }
}

/// Successful routed completion.
#[derive(Debug, Clone, Serialize)]
pub struct LlmReply {
    pub provider: String,
    pub model: String,
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Actual charged cost in the provider currency.
    pub cost_estimate: f64,
    pub latency_ms: u64,
}

/// What a single provider returns before routing bookkeeping.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
}

/// Failure kinds, as data. `rate_limit` and `network` are retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Auth,
    RateLimit,
    Network,
    Parse,
    Budget,
    Cancelled,
}

impl FailureKind {
    pub fn retryable(self) -> bool {
        matches!(self, Self::RateLimit | Self::Network)
    }
}

/// Structured failure of one LLM call.
#[derive(Debug, Clone, Error)]
#[error("llm {kind:?} failure from {provider}: {message}")]
pub struct LlmFailure {
    pub kind: FailureKind,
    pub provider: String,
    pub message: String,
}

impl LlmFailure {
    pub fn new(kind: FailureKind, provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

/// A model vendor endpoint the router can dispatch to.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name; must match its budget record.
    fn name(&self) -> &str;

    /// Whether a credential (when required) is present.
    fn available(&self) -> bool;

    async fn complete(&self, model: &str, request: &LlmRequest)
        -> Result<Completion, LlmFailure>;
}

/// Map an HTTP status to a failure kind.
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        401 | 403 => FailureKind::Auth,
        429 => FailureKind::RateLimit,
        402 => FailureKind::Budget,
        500..=599 => FailureKind::Network,
        _ => FailureKind::Parse,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_are_rate_limit_and_network() {
        assert!(FailureKind::RateLimit.retryable());
        assert!(FailureKind::Network.retryable());
        assert!(!FailureKind::Auth.retryable());
        assert!(!FailureKind::Parse.retryable());
        assert!(!FailureKind::Budget.retryable());
        assert!(!FailureKind::Cancelled.retryable());
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(401), FailureKind::Auth);
        assert_eq!(classify_status(429), FailureKind::RateLimit);
        assert_eq!(classify_status(503), FailureKind::Network);
        assert_eq!(classify_status(402), FailureKind::Budget);
    }

    #[test]
    fn input_token_estimate_counts_all_messages() {
        let req = LlmRequest::new(
            Tier::Level1,
            vec![
                Message::new("system", "abcd".repeat(10)),
                Message::new("user", "efgh".repeat(10)),
            ],
            512,
        );
        assert_eq!(req.estimated_input_tokens(), 20);
    }
}
