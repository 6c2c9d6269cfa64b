//! Executor: runs planned actions sequentially with capture, never throwing.
//!
//! Order is the plan's order. A failed action stops the rest of the plan
//! only when that entry is marked `halt_on_failure`; otherwise execution
//! continues and the captured failure becomes context for the next
//! iteration.

use crate::memory::BlobStore;
use crate::safety::SafetyValidator;
use crate::tools::ToolRegistry;
use crate::types::{Action, BlobEventType, ToolOutcome};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Executor {
    registry: Arc<ToolRegistry>,
    validator: Arc<SafetyValidator>,
    blob: BlobStore,
}

impl Executor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        validator: Arc<SafetyValidator>,
        blob: BlobStore,
    ) -> Self {
        Self {
            registry,
            validator,
            blob,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute every action in order, capturing one outcome per action.
    pub async fn execute_plan(&self, actions: &[Action], iteration: u64) -> Vec<ToolOutcome> {
        let mut outcomes = Vec::with_capacity(actions.len());

        for (index, action) in actions.iter().enumerate() {
            info!(
                "[iter {iteration}] Action {index}: {} ({:?})",
                action.tool,
                action.parameter_keys()
            );

            // Unknown tools are a validation error, not a dispatch.
            if !self.registry.contains(&action.tool) {
                let outcome =
                    ToolOutcome::failure(&action.tool, format!("Unknown tool: {}", action.tool));
                self.blob
                    .append(
                        BlobEventType::Error,
                        &format!("Validation failed: unknown tool '{}'", action.tool),
                        json!({"kind": "validation", "iteration": iteration}),
                    )
                    .ok();
                let halt = action.halt_on_failure;
                outcomes.push(outcome);
                if halt {
                    break;
                }
                continue;
            }

            // Safety gate runs before any dispatch.
            if let Err(violation) = self.validator.validate_action(action, &self.blob) {
                warn!("Action blocked: {violation}");
                self.blob
                    .append(
                        BlobEventType::Error,
                        &violation.to_string(),
                        json!({
                            "kind": "safety",
                            "rule": violation.rule,
                            "tool": action.tool,
                            "iteration": iteration,
                        }),
                    )
                    .ok();
                let outcome = ToolOutcome::failure(&action.tool, violation.to_string());
                let halt = action.halt_on_failure;
                outcomes.push(outcome);
                if halt {
                    break;
                }
                continue;
            }

            self.blob
                .append(
                    BlobEventType::ToolCall,
                    &format!("{}({})", action.tool, action.parameters),
                    json!({"tool": action.tool, "iteration": iteration}),
                )
                .ok();

            let mut outcome = self
                .registry
                .invoke(&action.tool, action.parameters.clone())
                .await;
            outcome.output = self.validator.sanitize(&outcome.output);

            self.blob
                .append(
                    BlobEventType::ToolResult,
                    &format!(
                        "{} -> {} ({} ms)",
                        action.tool,
                        if outcome.success { "ok" } else { "failed" },
                        outcome.duration_ms
                    ),
                    json!({
                        "tool": action.tool,
                        "success": outcome.success,
                        "error": outcome.error,
                        "duration_ms": outcome.duration_ms,
                        "iteration": iteration,
                    }),
                )
                .ok();

            let failed = !outcome.success;
            outcomes.push(outcome);
            if failed && action.halt_on_failure {
                warn!("Halting plan after failed action '{}'", action.tool);
                break;
            }
        }

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::SafetyRules;
    use crate::tools::{Tool, ToolSpec};
    use anyhow::Result;
    use async_trait::async_trait;

    struct AlwaysOk;

    #[async_trait]
    impl Tool for AlwaysOk {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "ok".into(),
                description: "Always succeeds.".into(),
                timeout_seconds: 5,
                parameters: json!({"type": "object", "properties": {}}),
                tier_hint: None,
            }
        }

        async fn execute(&self, _args: serde_json::Value) -> Result<String> {
            Ok("done".into())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Tool for AlwaysFails {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "fails".into(),
                description: "Always fails.".into(),
                timeout_seconds: 5,
                parameters: json!({"type": "object", "properties": {}}),
                tier_hint: None,
            }
        }

        async fn execute(&self, _args: serde_json::Value) -> Result<String> {
            anyhow::bail!("broken")
        }
    }

    fn executor() -> (tempfile::TempDir, Executor, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let blob = BlobStore::new(dir.path().join("blob")).unwrap();
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(AlwaysOk)).unwrap();
        registry.register(Arc::new(AlwaysFails)).unwrap();
        let executor = Executor::new(
            Arc::new(registry),
            Arc::new(SafetyValidator::new(SafetyRules::global())),
            blob.clone(),
        );
        (dir, executor, blob)
    }

    fn action(tool: &str, halt: bool) -> Action {
        Action {
            tool: tool.into(),
            tier: None,
            parameters: json!({}),
            halt_on_failure: halt,
        }
    }

    #[tokio::test]
    async fn unknown_tool_records_validation_error_and_continues() {
        let (_dir, executor, blob) = executor();
        let outcomes = executor
            .execute_plan(&[action("unknown_tool", false), action("ok", false)], 1)
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].success);
        assert!(outcomes[1].success);

        let events = blob.read_recent(20).unwrap();
        let validation = events
            .iter()
            .find(|e| e.metadata.get("kind").and_then(|k| k.as_str()) == Some("validation"))
            .unwrap();
        assert!(validation.content.contains("unknown_tool"));
    }

    #[tokio::test]
    async fn failure_without_halt_continues() {
        let (_dir, executor, _blob) = executor();
        let outcomes = executor
            .execute_plan(&[action("fails", false), action("ok", false)], 1)
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].success);
        assert!(outcomes[1].success);
    }

    #[tokio::test]
    async fn halt_on_failure_stops_the_plan() {
        let (_dir, executor, _blob) = executor();
        let outcomes = executor
            .execute_plan(&[action("fails", true), action("ok", false)], 1)
            .await;
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].success);
    }

    #[tokio::test]
    async fn safety_violation_skips_action_with_rule_number() {
        let (_dir, executor, blob) = executor();
        let mut bad = action("ok", false);
        bad.parameters = json!({"script": "disable the logging pipeline"});
        let outcomes = executor.execute_plan(&[bad, action("ok", false)], 2).await;
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].success);
        assert!(outcomes[1].success);

        let events = blob.read_recent(20).unwrap();
        let violation = events
            .iter()
            .find(|e| e.metadata.get("kind").and_then(|k| k.as_str()) == Some("safety"))
            .unwrap();
        assert_eq!(violation.metadata.get("rule").and_then(|r| r.as_u64()), Some(5));
    }

    #[tokio::test]
    async fn tool_call_and_result_events_are_written_in_order() {
        let (_dir, executor, blob) = executor();
        executor.execute_plan(&[action("ok", false)], 3).await;
        let events = blob.read_recent(20).unwrap();
        let call_pos = events
            .iter()
            .position(|e| e.event_type == BlobEventType::ToolCall)
            .unwrap();
        let result_pos = events
            .iter()
            .position(|e| e.event_type == BlobEventType::ToolResult)
            .unwrap();
        assert!(call_pos < result_pos);
    }
}
