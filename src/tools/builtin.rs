//! Built-in tools. Thin, real bodies; heavyweight capabilities (browsers,
//! mail transport) stay behind external collaborators.

use crate::budget::BudgetTracker;
use crate::llm::{LlmRequest, LlmRouter, Message};
use crate::memory::{MemoryEntry, NotePad, VectorStore};
use crate::safety::SafetyValidator;
use crate::selfupdate::{SelfUpdater, UpdateProposal};
use crate::state::Database;
use crate::tools::{Tool, ToolSpec};
use crate::types::Tier;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

fn require_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str> {
    args[key]
        .as_str()
        .ok_or_else(|| anyhow!("Missing '{key}' argument"))
}

// ---------------------------------------------------------------------------
// Scratch pad
// ---------------------------------------------------------------------------

/// Append a short operational breadcrumb to the scratch pad.
pub struct NoteTool {
    pub pad: NotePad,
    pub db: Arc<Mutex<Database>>,
}

#[async_trait]
impl Tool for NoteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "note".into(),
            description: "Write a short note to the bounded scratch pad.".into(),
            timeout_seconds: 10,
            parameters: json!({
                "type": "object",
                "properties": {
                    "content": {"type": "string", "description": "The note text"}
                },
                "required": ["content"]
            }),
            tier_hint: None,
        }
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String> {
        let content = require_str(&args, "content")?;
        let iteration = {
            let db = self.db.lock().await;
            db.snapshot()?.iteration
        };
        self.pad.add(content, iteration).await?;
        Ok(format!("Noted ({} chars)", content.len()))
    }
}

// ---------------------------------------------------------------------------
// Vector memory
// ---------------------------------------------------------------------------

/// Store an important finding in long-term memory, or re-reinforce an
/// existing entry against decay.
pub struct MemoryWriteTool {
    pub vector: Arc<Mutex<VectorStore>>,
}

#[async_trait]
impl Tool for MemoryWriteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "memory_write".into(),
            description: "Store a finding in long-term vector memory, or reinforce an existing entry.".into(),
            timeout_seconds: 10,
            parameters: json!({
                "type": "object",
                "properties": {
                    "content": {"type": "string"},
                    "importance": {"type": "number", "description": "0.0-1.0, default 0.5"},
                    "permanent": {"type": "boolean", "description": "Exempt from TTL and decay"},
                    "ttl_hours": {"type": "integer"},
                    "reinforce_id": {"type": "string", "description": "Boost an existing entry instead of adding"},
                    "boost": {"type": "number", "description": "Importance boost for reinforce_id, default 0.1"}
                }
            }),
            tier_hint: None,
        }
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String> {
        let vector = self.vector.lock().await;

        // Reinforce path: counteract decay on an entry worth keeping.
        if let Some(id) = args["reinforce_id"].as_str() {
            if vector.get(id)?.is_none() {
                bail!("No such memory: {id}");
            }
            vector.reinforce(id, args["boost"].as_f64().unwrap_or(0.1))?;
            if args["permanent"].as_bool().unwrap_or(false) {
                vector.mark_permanent(id)?;
            }
            return Ok(format!("Reinforced memory {id}"));
        }

        let content = require_str(&args, "content")?;
        let importance = args["importance"].as_f64().unwrap_or(0.5);
        let mut entry = MemoryEntry::new(content, importance, "tool:memory_write");
        if args["permanent"].as_bool().unwrap_or(false) {
            entry = entry.permanent();
        }
        if let Some(ttl) = args["ttl_hours"].as_i64() {
            entry = entry.with_ttl(ttl);
        }
        let id = vector.add(&entry)?;
        Ok(format!("Stored memory {id}"))
    }
}

/// Query long-term memory by similarity.
pub struct MemorySearchTool {
    pub vector: Arc<Mutex<VectorStore>>,
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "memory_search".into(),
            description: "Search long-term vector memory.".into(),
            timeout_seconds: 10,
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "description": "Default 5"}
                },
                "required": ["query"]
            }),
            tier_hint: None,
        }
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String> {
        let query = require_str(&args, "query")?;
        let limit = args["limit"].as_u64().unwrap_or(5) as usize;
        let vector = self.vector.lock().await;
        let hits = vector.search(query, limit, 0.0)?;
        if hits.is_empty() {
            return Ok("No matching memories".into());
        }
        let mut out = String::new();
        for hit in hits {
            out.push_str(&format!(
                "[{:.2}] ({}) {}\n",
                hit.similarity, hit.entry.source, hit.entry.content
            ));
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// Report the current budget status.
pub struct BudgetQueryTool {
    pub budget: BudgetTracker,
}

#[async_trait]
impl Tool for BudgetQueryTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "budget_query".into(),
            description: "Read the monthly budget and per-provider balances.".into(),
            timeout_seconds: 10,
            parameters: json!({"type": "object", "properties": {}}),
            tier_hint: None,
        }
    }

    async fn execute(&self, _args: serde_json::Value) -> Result<String> {
        let status = self.budget.status().await?;
        Ok(serde_json::to_string_pretty(&status)?)
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

const HTTP_BODY_CAP: usize = 10_000;

/// Fetch a URL. GET or POST, response capped.
pub struct HttpRequestTool {
    client: reqwest::Client,
}

impl HttpRequestTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(25))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "http_request".into(),
            description: "Fetch a URL (GET or POST); response is truncated.".into(),
            timeout_seconds: 30,
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"},
                    "method": {"type": "string", "description": "GET (default) or POST"},
                    "body": {"type": "string", "description": "POST body"}
                },
                "required": ["url"]
            }),
            tier_hint: None,
        }
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String> {
        let url = require_str(&args, "url")?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            bail!("Only http(s) URLs are allowed");
        }
        let method = args["method"].as_str().unwrap_or("GET").to_uppercase();
        let request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => {
                let body = args["body"].as_str().unwrap_or("").to_string();
                self.client.post(url).body(body)
            }
            other => bail!("Unsupported method: {other}"),
        };

        let response = request.send().await?;
        let status = response.status();
        let mut body = response.text().await.unwrap_or_default();
        if body.chars().count() > HTTP_BODY_CAP {
            body = body.chars().take(HTTP_BODY_CAP).collect::<String>() + "\n[...truncated...]";
        }
        Ok(format!("HTTP {status}\n{body}"))
    }
}

// ---------------------------------------------------------------------------
// Telegram
// ---------------------------------------------------------------------------

/// Send a message to the creator's Telegram chat.
pub struct SendTelegramTool {
    pub bot_token: String,
    pub chat_id: String,
    pub client: reqwest::Client,
}

#[async_trait]
impl Tool for SendTelegramTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "send_telegram".into(),
            description: "Send a Telegram message to the creator.".into(),
            timeout_seconds: 20,
            parameters: json!({
                "type": "object",
                "properties": {
                    "content": {"type": "string"}
                },
                "required": ["content"]
            }),
            tier_hint: None,
        }
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String> {
        let content = require_str(&args, "content")?;
        if self.bot_token.is_empty() || self.chat_id.is_empty() {
            bail!("Telegram is not configured");
        }
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let response = self
            .client
            .post(&url)
            .json(&json!({"chat_id": self.chat_id, "text": content}))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("Telegram API returned {}", response.status());
        }
        Ok("Sent".into())
    }
}

// ---------------------------------------------------------------------------
// Coding agent
// ---------------------------------------------------------------------------

/// Delegate a coding task to the coding model ladder.
pub struct CodingAgentTool {
    pub router: Arc<LlmRouter>,
}

#[async_trait]
impl Tool for CodingAgentTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "coding_agent".into(),
            description: "Run a coding task on the zero-cost coding model ladder.".into(),
            timeout_seconds: 180,
            parameters: json!({
                "type": "object",
                "properties": {
                    "task": {"type": "string", "description": "What to write or fix"},
                    "tier": {"type": "string", "description": "coding_level1..3, default coding_level1"}
                },
                "required": ["task"]
            }),
            tier_hint: Some(Tier::CodingLevel1),
        }
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String> {
        let task = require_str(&args, "task")?;
        let tier = args["tier"]
            .as_str()
            .and_then(|t| t.parse::<Tier>().ok())
            .filter(|t| t.is_coding())
            .unwrap_or(Tier::CodingLevel1);

        let messages = vec![
            Message::new(
                "system",
                "You are a careful coding assistant. Return only the requested \
                 code or patch, with a one-line explanation at the end.",
            ),
            Message::new("user", task),
        ];
        let reply = self
            .router
            .complete(LlmRequest::new(tier, messages, 4096), "coding_agent")
            .await?;
        Ok(reply.content)
    }
}

// ---------------------------------------------------------------------------
// Self-update
// ---------------------------------------------------------------------------

/// Propose a modification to the agent's own source.
pub struct SelfUpdateTool {
    pub updater: Arc<SelfUpdater>,
    pub validator: Arc<SafetyValidator>,
}

#[async_trait]
impl Tool for SelfUpdateTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "self_update".into(),
            description: "Modify own source files (versioned, validated, revertible).".into(),
            timeout_seconds: 60,
            parameters: json!({
                "type": "object",
                "properties": {
                    "paths": {"type": "array", "items": {"type": "string"}},
                    "contents": {"type": "array", "items": {"type": "string"}},
                    "message": {"type": "string", "description": "Version log message"}
                },
                "required": ["paths", "contents", "message"]
            }),
            tier_hint: None,
        }
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String> {
        let paths: Vec<String> = args["paths"]
            .as_array()
            .ok_or_else(|| anyhow!("Missing 'paths' argument"))?
            .iter()
            .filter_map(|p| p.as_str().map(String::from))
            .collect();
        let contents: Vec<String> = args["contents"]
            .as_array()
            .ok_or_else(|| anyhow!("Missing 'contents' argument"))?
            .iter()
            .filter_map(|c| c.as_str().map(String::from))
            .collect();
        let message = require_str(&args, "message")?.to_string();

        let proposal = UpdateProposal {
            paths,
            new_contents: contents,
            message,
        };
        let updater = self.updater.clone();
        let validator = self.validator.clone();
        // Git and file I/O are blocking; keep them off the async runtime.
        let summary = tokio::task::spawn_blocking(move || {
            updater.propose(&validator, &proposal)
        })
        .await??;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db() -> Arc<Mutex<Database>> {
        let db = Database::open_memory().unwrap();
        db.load_or_init_state("d").unwrap();
        Arc::new(Mutex::new(db))
    }

    #[tokio::test]
    async fn note_tool_writes_to_the_scratch_pad() {
        let db = db().await;
        let tool = NoteTool {
            pad: NotePad::new(db.clone()),
            db: db.clone(),
        };
        let out = tool
            .execute(json!({"content": "check the inbox tomorrow"}))
            .await
            .unwrap();
        assert!(out.starts_with("Noted"));
        let db = db.lock().await;
        assert_eq!(db.note_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_write_stores_and_reinforces() {
        let vector = Arc::new(Mutex::new(VectorStore::open_memory().unwrap()));
        let tool = MemoryWriteTool {
            vector: vector.clone(),
        };

        let out = tool
            .execute(json!({"content": "the gateway lives on port 8420", "importance": 0.4}))
            .await
            .unwrap();
        let id = out.strip_prefix("Stored memory ").unwrap().to_string();

        tool.execute(json!({"reinforce_id": id, "boost": 0.3, "permanent": true}))
            .await
            .unwrap();

        let store = vector.lock().await;
        let entry = store.get(&id).unwrap().unwrap();
        assert!((entry.importance - 0.7).abs() < 1e-9);
        assert!(entry.permanent);
    }

    #[tokio::test]
    async fn memory_write_rejects_unknown_reinforce_target() {
        let vector = Arc::new(Mutex::new(VectorStore::open_memory().unwrap()));
        let tool = MemoryWriteTool { vector };
        let err = tool
            .execute(json!({"reinforce_id": "nope"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No such memory"));
    }

    #[tokio::test]
    async fn memory_search_formats_hits() {
        let vector = Arc::new(Mutex::new(VectorStore::open_memory().unwrap()));
        {
            let store = vector.lock().await;
            store
                .add(&MemoryEntry::new(
                    "the budget resets on the first of the month",
                    0.5,
                    "test",
                ))
                .unwrap();
        }
        let tool = MemorySearchTool { vector };
        let out = tool
            .execute(json!({"query": "budget reset month", "limit": 3}))
            .await
            .unwrap();
        assert!(out.contains("budget resets"));
    }

    #[tokio::test]
    async fn budget_query_reports_status_json() {
        let db = db().await;
        let budget = BudgetTracker::new(db, 50.0);
        budget.ensure_seeded(&[]).await.unwrap();
        let tool = BudgetQueryTool { budget };
        let out = tool.execute(json!({})).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["monthly_cap_usd"].as_f64(), Some(50.0));
    }
}
