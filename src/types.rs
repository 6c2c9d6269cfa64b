//! Shared types used across the vigil runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Model tiers
// ---------------------------------------------------------------------------

/// Priority classes of language models, best first. The coding ladder is a
/// parallel track that falls back into the general ladder at the bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Level1,
    Level2,
    Level3,
    CodingLevel1,
    CodingLevel2,
    CodingLevel3,
    /// Offline fallback, always available, zero cost.
    LocalOnly,
}

impl Tier {
    /// The next tier down the ladder, or `None` at the bottom.
    pub fn degrade(self) -> Option<Tier> {
        match self {
            Self::Level1 => Some(Self::Level2),
            Self::Level2 => Some(Self::Level3),
            Self::Level3 => Some(Self::LocalOnly),
            Self::CodingLevel1 => Some(Self::CodingLevel2),
            Self::CodingLevel2 => Some(Self::CodingLevel3),
            Self::CodingLevel3 => Some(Self::Level3),
            Self::LocalOnly => None,
        }
    }

    pub fn is_coding(self) -> bool {
        matches!(
            self,
            Self::CodingLevel1 | Self::CodingLevel2 | Self::CodingLevel3
        )
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Level1 => write!(f, "level1"),
            Self::Level2 => write!(f, "level2"),
            Self::Level3 => write!(f, "level3"),
            Self::CodingLevel1 => write!(f, "coding_level1"),
            Self::CodingLevel2 => write!(f, "coding_level2"),
            Self::CodingLevel3 => write!(f, "coding_level3"),
            Self::LocalOnly => write!(f, "local_only"),
        }
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "level1" => Ok(Self::Level1),
            "level2" => Ok(Self::Level2),
            "level3" => Ok(Self::Level3),
            "coding_level1" => Ok(Self::CodingLevel1),
            "coding_level2" => Ok(Self::CodingLevel2),
            "coding_level3" => Ok(Self::CodingLevel3),
            "local_only" => Ok(Self::LocalOnly),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    Creator,
    Agent,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creator => write!(f, "creator"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

impl FromStr for ChatRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creator" => Ok(Self::Creator),
            "agent" => Ok(Self::Agent),
            other => Err(format!("unknown chat role: {other}")),
        }
    }
}

/// The channel a chat message arrived on (and where replies go back).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Web,
    Telegram,
    Mail,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Web => write!(f, "web"),
            Self::Telegram => write!(f, "telegram"),
            Self::Mail => write!(f, "mail"),
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(Self::Web),
            "telegram" => Ok(Self::Telegram),
            "mail" => Ok(Self::Mail),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// A persisted chat message, ordered by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: i64,
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub channel: Channel,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// One action requested by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub tool: String,
    #[serde(default)]
    pub tier: Option<Tier>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// When true, a failure of this action stops the rest of the plan.
    #[serde(default)]
    pub halt_on_failure: bool,
}

impl Action {
    /// The parameter key names, for audit records (values stay in the blob).
    pub fn parameter_keys(&self) -> Vec<String> {
        match &self.parameters {
            serde_json::Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

/// Structured plan returned by the tier-1 model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub thinking: String,
    pub status_message: String,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub chat_reply: Option<String>,
    #[serde(default)]
    pub short_term_goals: Option<Vec<String>>,
    #[serde(default)]
    pub mid_term_goals: Option<Vec<String>>,
    #[serde(default)]
    pub long_term_goals: Option<Vec<String>>,
    #[serde(default)]
    pub memory_config: Option<MemoryConfigPatch>,
    #[serde(default)]
    pub next_sleep_seconds: Option<f64>,
}

/// Outcome of parsing a model response into a plan.
#[derive(Debug, Clone)]
pub enum ParsedPlan {
    Valid(Plan),
    Invalid { reason: String },
}

// ---------------------------------------------------------------------------
// Memory configuration
// ---------------------------------------------------------------------------

/// Tunable retrieval/decay parameters the agent may adjust at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub retrieval_count: usize,
    pub relevance_threshold: f32,
    pub decay_factor: f32,
    pub max_context_tokens: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            retrieval_count: 10,
            relevance_threshold: 0.35,
            decay_factor: 0.95,
            max_context_tokens: 24_000,
        }
    }
}

impl MemoryConfig {
    /// Apply a patch, clamping each field to its legal range.
    pub fn apply(&mut self, patch: &MemoryConfigPatch) {
        if let Some(n) = patch.retrieval_count {
            self.retrieval_count = n.clamp(1, 100);
        }
        if let Some(t) = patch.relevance_threshold {
            self.relevance_threshold = t.clamp(0.0, 1.0);
        }
        if let Some(d) = patch.decay_factor {
            self.decay_factor = d.clamp(0.5, 1.0);
        }
        if let Some(m) = patch.max_context_tokens {
            self.max_context_tokens = m.max(1_000);
        }
    }
}

/// Partial update to [`MemoryConfig`], from the plan or the API.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoryConfigPatch {
    #[serde(default)]
    pub retrieval_count: Option<usize>,
    #[serde(default)]
    pub relevance_threshold: Option<f32>,
    #[serde(default)]
    pub decay_factor: Option<f32>,
    #[serde(default)]
    pub max_context_tokens: Option<usize>,
}

// ---------------------------------------------------------------------------
// Iteration records
// ---------------------------------------------------------------------------

/// Token usage of one model call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Audit summary of one executed action (parameter values stay in the blob).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub tool: String,
    pub tier: Option<Tier>,
    pub parameters_keys: Vec<String>,
}

/// Summary of one full plan-execute-record cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub n: u64,
    pub started_at: DateTime<Utc>,
    pub model: String,
    pub provider: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub thinking: String,
    pub status_message: String,
    pub actions: Vec<ActionRecord>,
    #[serde(default)]
    pub chat_reply: Option<String>,
    pub next_sleep_s: f64,
}

// ---------------------------------------------------------------------------
// Tool outcomes
// ---------------------------------------------------------------------------

/// Uniform result of a tool invocation. Tools never panic or throw across
/// this boundary; failures become `success = false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool: String,
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl ToolOutcome {
    pub fn failure(tool: &str, error: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            success: false,
            output: String::new(),
            error: Some(error.into()),
            duration_ms: 0,
            meta: serde_json::Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Blob events
// ---------------------------------------------------------------------------

/// Kinds of events in the append-only audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobEventType {
    LlmRequest,
    LlmResponse,
    ToolCall,
    ToolResult,
    ChatCreator,
    ChatAgent,
    System,
    Error,
    Planning,
}

impl fmt::Display for BlobEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LlmRequest => write!(f, "llm_request"),
            Self::LlmResponse => write!(f, "llm_response"),
            Self::ToolCall => write!(f, "tool_call"),
            Self::ToolResult => write!(f, "tool_result"),
            Self::ChatCreator => write!(f, "chat_creator"),
            Self::ChatAgent => write!(f, "chat_agent"),
            Self::System => write!(f, "system"),
            Self::Error => write!(f, "error"),
            Self::Planning => write!(f, "planning"),
        }
    }
}

// ---------------------------------------------------------------------------
// Goals and state snapshots
// ---------------------------------------------------------------------------

/// The three goal horizons, shortest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoalSet {
    pub short_term: Vec<String>,
    pub mid_term: Vec<String>,
    pub long_term: Vec<String>,
}

impl GoalSet {
    /// Flattened goal text, used for the synthetic retrieval query.
    pub fn joined(&self) -> String {
        self.short_term
            .iter()
            .chain(self.mid_term.iter())
            .chain(self.long_term.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Snapshot of the durable agent state, loaded at the top of each iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub directive: String,
    pub goals: GoalSet,
    pub active_task: Option<String>,
    pub iteration: u64,
    pub paused: bool,
    pub chat_cursor: i64,
    pub memory_config: MemoryConfig,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Short-term notes
// ---------------------------------------------------------------------------

/// One scratch-pad note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub idx: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub iteration: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ladder_degrades_to_local_only() {
        let mut tier = Tier::Level1;
        let mut seen = vec![tier];
        while let Some(next) = tier.degrade() {
            seen.push(next);
            tier = next;
        }
        assert_eq!(
            seen,
            vec![Tier::Level1, Tier::Level2, Tier::Level3, Tier::LocalOnly]
        );
    }

    #[test]
    fn coding_ladder_rejoins_general_ladder() {
        assert_eq!(Tier::CodingLevel3.degrade(), Some(Tier::Level3));
        assert!(Tier::CodingLevel2.is_coding());
        assert!(!Tier::Level2.is_coding());
    }

    #[test]
    fn tier_roundtrips_through_str() {
        for tier in [Tier::Level1, Tier::CodingLevel2, Tier::LocalOnly] {
            assert_eq!(tier.to_string().parse::<Tier>().unwrap(), tier);
        }
    }

    #[test]
    fn memory_config_patch_clamps_ranges() {
        let mut cfg = MemoryConfig::default();
        cfg.apply(&MemoryConfigPatch {
            retrieval_count: Some(500),
            relevance_threshold: Some(2.0),
            decay_factor: Some(0.1),
            max_context_tokens: Some(10),
        });
        assert_eq!(cfg.retrieval_count, 100);
        assert_eq!(cfg.relevance_threshold, 1.0);
        assert_eq!(cfg.decay_factor, 0.5);
        assert_eq!(cfg.max_context_tokens, 1_000);
    }

    #[test]
    fn action_parameter_keys_are_names_only() {
        let action = Action {
            tool: "http_request".into(),
            tier: None,
            parameters: serde_json::json!({"url": "https://example.com", "method": "GET"}),
            halt_on_failure: false,
        };
        let mut keys = action.parameter_keys();
        keys.sort();
        assert_eq!(keys, vec!["method", "url"]);
    }
}
