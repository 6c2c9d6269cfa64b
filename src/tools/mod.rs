//! Tool registry: named capabilities behind one invocation contract.
//!
//! Registration is append-only and fully introspectable (no tool can be
//! hidden or replaced after the fact). Invocation is bounded by the tool's
//! declared timeout, and any internal failure is converted into a
//! `success = false` outcome rather than propagating.

pub mod builtin;

use crate::types::{Tier, ToolOutcome};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Fallback timeout when a tool declares none.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Static description of a tool, exposed to the planner and the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub timeout_seconds: u64,
    /// JSON Schema for the parameters (names, types, required).
    pub parameters: serde_json::Value,
    /// Routing hint for tools that drive the coding ladder.
    pub tier_hint: Option<Tier>,
}

/// A named capability.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Run with the given arguments. Errors here become failed outcomes at
    /// the registry boundary; implementations never need to catch panics.
    async fn execute(&self, args: serde_json::Value) -> Result<String>;
}

/// Append-only set of registered tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names are permanent: re-registering one is refused.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.spec().name;
        if self.tools.contains_key(&name) {
            bail!("Tool '{name}' is already registered");
        }
        info!("Tool registered: {name}");
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Every registered spec (introspection; nothing is hidden).
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| t.spec()).collect()
    }

    /// Invoke a tool with its declared timeout. Never throws.
    pub async fn invoke(&self, name: &str, params: serde_json::Value) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            return ToolOutcome::failure(name, format!("Unknown tool: {name}"));
        };

        let spec = tool.spec();
        let timeout = Duration::from_secs(if spec.timeout_seconds == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            spec.timeout_seconds
        });

        let started = Instant::now();
        let result = tokio::time::timeout(timeout, tool.execute(params)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => ToolOutcome {
                tool: name.to_string(),
                success: true,
                output,
                error: None,
                duration_ms,
                meta: serde_json::Value::Null,
            },
            Ok(Err(err)) => {
                warn!("Tool {name} failed: {err:#}");
                ToolOutcome {
                    tool: name.to_string(),
                    success: false,
                    output: String::new(),
                    error: Some(format!("{err:#}")),
                    duration_ms,
                    meta: serde_json::Value::Null,
                }
            }
            Err(_) => {
                warn!("Tool {name} timed out after {timeout:?}");
                ToolOutcome {
                    tool: name.to_string(),
                    success: false,
                    output: String::new(),
                    error: Some("timeout".into()),
                    duration_ms,
                    meta: serde_json::Value::Null,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".into(),
                description: "Echo the input back.".into(),
                timeout_seconds: 5,
                parameters: json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }),
                tier_hint: None,
            }
        }

        async fn execute(&self, args: serde_json::Value) -> Result<String> {
            let text = args["text"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("Missing 'text' argument"))?;
            Ok(text.to_string())
        }
    }

    struct Sleeper;

    #[async_trait]
    impl Tool for Sleeper {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "sleeper".into(),
                description: "Sleeps past its own timeout.".into(),
                timeout_seconds: 1,
                parameters: json!({"type": "object", "properties": {}}),
                tier_hint: None,
            }
        }

        async fn execute(&self, _args: serde_json::Value) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("never".into())
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        registry.register(Arc::new(Sleeper)).unwrap();
        registry
    }

    #[tokio::test]
    async fn invoke_returns_tool_output() {
        let outcome = registry().invoke("echo", json!({"text": "hello"})).await;
        assert!(outcome.success);
        assert_eq!(outcome.output, "hello");
    }

    #[tokio::test]
    async fn unknown_tool_is_a_failed_outcome() {
        let outcome = registry().invoke("nope", json!({})).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn tool_errors_become_outcomes_not_panics() {
        let outcome = registry().invoke("echo", json!({})).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Missing 'text'"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_expiry_is_reported_as_timeout() {
        let outcome = registry().invoke("sleeper", json!({})).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap(), "timeout");
    }

    #[test]
    fn registration_is_append_only() {
        let mut registry = registry();
        assert!(registry.register(Arc::new(Echo)).is_err());
        assert_eq!(registry.names(), vec!["echo", "sleeper"]);
        assert_eq!(registry.specs().len(), 2);
    }
}
