//! Planner: assembles the working context, calls the tier-1 model, and
//! parses the structured plan.
//!
//! Repeated parse failures force a one-iteration tier downgrade; repeated
//! identical plans inject a stuck-loop warning into the next context.

use crate::budget::BudgetSummary;
use crate::llm::{LlmRequest, LlmRouter, Message};
use crate::memory::working::{ContextBuilder, ContextMessage, WorkingContext};
use crate::memory::VectorStore;
use crate::safety::SafetyRules;
use crate::types::*;
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Chat messages included in the context tail.
const CHAT_WINDOW: usize = 12;

/// Tool-result summaries carried into the next context.
const RESULT_WINDOW: usize = 8;

/// Parse failures before a mandatory tier downgrade.
const PARSE_FAILURE_DOWNGRADE: u32 = 3;

/// Action-signature history for stuck-loop detection.
const SIG_HISTORY: usize = 10;
const SIG_REPEAT_THRESHOLD: usize = 3;

/// What one planning call produced.
pub struct PlanOutcome {
    pub parsed: ParsedPlan,
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub cost: f64,
}

pub struct Planner {
    router: Arc<LlmRouter>,
    vector: Arc<Mutex<VectorStore>>,
    rules: &'static SafetyRules,
    consecutive_parse_failures: AtomicU32,
    action_sigs: std::sync::Mutex<VecDeque<String>>,
    result_summaries: std::sync::Mutex<VecDeque<String>>,
    /// Last assembled context, exposed read-only to the dashboard.
    last_context: Arc<RwLock<Option<WorkingContext>>>,
}

impl Planner {
    pub fn new(
        router: Arc<LlmRouter>,
        vector: Arc<Mutex<VectorStore>>,
        rules: &'static SafetyRules,
    ) -> Self {
        Self {
            router,
            vector,
            rules,
            consecutive_parse_failures: AtomicU32::new(0),
            action_sigs: std::sync::Mutex::new(VecDeque::new()),
            result_summaries: std::sync::Mutex::new(VecDeque::new()),
            last_context: Arc::new(RwLock::new(None)),
        }
    }

    /// Shared handle to the most recent working-context snapshot.
    pub fn context_handle(&self) -> Arc<RwLock<Option<WorkingContext>>> {
        self.last_context.clone()
    }

    /// Feed the previous iteration's outcomes back for the next context.
    pub fn remember_results(&self, outcomes: &[ToolOutcome]) {
        let mut summaries = self.result_summaries.lock().unwrap();
        for outcome in outcomes {
            let line = if outcome.success {
                format!("{}: ok: {}", outcome.tool, clip(&outcome.output, 400))
            } else {
                format!(
                    "{}: FAILED: {}",
                    outcome.tool,
                    clip(outcome.error.as_deref().unwrap_or("unknown error"), 250)
                )
            };
            summaries.push_back(line);
            if summaries.len() > RESULT_WINDOW {
                summaries.pop_front();
            }
        }
    }

    /// Build context, call the model, parse the plan.
    pub async fn plan(
        &self,
        snapshot: &AgentSnapshot,
        budget: &BudgetSummary,
        tool_names: &[String],
        pending_chat: &[ChatRecord],
        chat_history: &[ChatRecord],
        notes: &[Note],
    ) -> Result<PlanOutcome> {
        let config = snapshot.memory_config;

        // Synthetic retrieval query: goals plus the latest chat.
        let latest_chat = pending_chat
            .last()
            .map(|c| c.content.as_str())
            .unwrap_or_default();
        let query = format!(
            "{} {} {}",
            snapshot.active_task.as_deref().unwrap_or(""),
            latest_chat,
            snapshot.goals.joined()
        );
        let memories = {
            let vector = self.vector.lock().await;
            vector
                .search(
                    query.trim(),
                    config.retrieval_count,
                    config.relevance_threshold,
                )?
                .into_iter()
                .map(|hit| hit.entry.content)
                .collect::<Vec<_>>()
        };

        let mut builder = ContextBuilder::new(self.preamble(snapshot, budget, tool_names));
        builder
            .inject_memories(memories)
            .notes(notes.iter().map(|n| n.content.clone()).collect())
            .chat(
                chat_history
                    .iter()
                    .rev()
                    .take(CHAT_WINDOW)
                    .rev()
                    .map(|c| ContextMessage {
                        role: match c.role {
                            ChatRole::Creator => "user".into(),
                            ChatRole::Agent => "assistant".into(),
                        },
                        content: c.content.clone(),
                    })
                    .collect(),
            )
            .results(
                self.result_summaries
                    .lock()
                    .unwrap()
                    .iter()
                    .cloned()
                    .collect(),
            )
            .instruction(self.iteration_prompt(snapshot, pending_chat, notes));

        let context = builder.build(config);
        *self.last_context.write().await = Some(context.clone());

        // Tier: level1, downgraded after repeated parse failures.
        let tier = if self.consecutive_parse_failures.load(Ordering::SeqCst)
            >= PARSE_FAILURE_DOWNGRADE
        {
            warn!("Repeated parse failures; downgrading planning tier");
            Tier::Level1.degrade().unwrap_or(Tier::Level2)
        } else {
            Tier::Level1
        };

        let mut messages = vec![Message::new("system", context.system_prompt.clone())];
        messages.extend(
            context
                .messages
                .iter()
                .map(|m| Message::new(m.role.clone(), m.content.clone())),
        );

        let purpose = if pending_chat.is_empty() {
            "planning"
        } else {
            "chat_iteration"
        };
        let reply = self
            .router
            .complete(LlmRequest::new(tier, messages, 4096), purpose)
            .await?;

        let parsed = parse_plan(&reply.content);
        match &parsed {
            ParsedPlan::Valid(plan) => {
                self.consecutive_parse_failures.store(0, Ordering::SeqCst);
                self.track_signature(plan);
                info!(
                    "Plan: {} actions via {}/{}",
                    plan.actions.len(),
                    reply.provider,
                    reply.model
                );
            }
            ParsedPlan::Invalid { reason } => {
                let failures = self
                    .consecutive_parse_failures
                    .fetch_add(1, Ordering::SeqCst)
                    + 1;
                warn!("Plan parse failed ({failures} consecutive): {reason}");
            }
        }

        Ok(PlanOutcome {
            parsed,
            model: reply.model,
            provider: reply.provider,
            usage: TokenUsage {
                input_tokens: reply.input_tokens,
                output_tokens: reply.output_tokens,
            },
            cost: reply.cost_estimate,
        })
    }

    /// Immutable preamble: rules, directive, goals, budget, tools.
    fn preamble(
        &self,
        snapshot: &AgentSnapshot,
        budget: &BudgetSummary,
        tool_names: &[String],
    ) -> String {
        let mut out = String::with_capacity(4096);
        out.push_str(&self.rules.prompt_section());
        out.push_str("\n## Directive\n");
        out.push_str(&snapshot.directive);
        out.push_str("\n\n## Goals\n");
        out.push_str(&format!(
            "short-term: {:?}\nmid-term: {:?}\nlong-term: {:?}\n",
            snapshot.goals.short_term, snapshot.goals.mid_term, snapshot.goals.long_term
        ));
        out.push_str(&format!(
            "\n## Budget\nremaining ${:.2} of ${:.2} ({:.0}% used)\n",
            budget.remaining_usd, budget.monthly_cap_usd, budget.percent_used
        ));
        out.push_str(&format!("\n## Tools\n{}\n", tool_names.join(", ")));
        out.push_str(PLAN_FORMAT);
        out
    }

    /// The per-iteration instruction block.
    fn iteration_prompt(
        &self,
        snapshot: &AgentSnapshot,
        pending_chat: &[ChatRecord],
        notes: &[Note],
    ) -> String {
        let mut sections = Vec::new();
        sections.push(format!("<iteration number=\"{}\">", snapshot.iteration));
        sections.push(format!(
            "<active_task>{}</active_task>",
            snapshot.active_task.as_deref().unwrap_or("none")
        ));

        if !notes.is_empty() {
            sections.push(format!("<scratchpad slots=\"{}/50\" />", notes.len()));
        }

        if let Some(warning) = self.stuck_loop_warning() {
            sections.push(format!("<warning type=\"stuck_loop\">{warning}</warning>"));
        }

        if !pending_chat.is_empty() {
            sections.push("<creator_chat>".into());
            sections.push(
                "Your creator is talking to you. Include a `chat_reply` field.".into(),
            );
            for (i, msg) in pending_chat.iter().enumerate() {
                sections.push(format!("Message {} ({}): {}", i + 1, msg.channel, msg.content));
            }
            sections.push("</creator_chat>".into());
        }

        if snapshot.iteration > 0 && snapshot.iteration % 5 == 0 {
            sections.push(
                "<goal_review required=\"true\">Review and update your goal tiers \
                 in this response.</goal_review>"
                    .into(),
            );
        }

        sections.push(
            "<instructions>Plan your next actions as JSON. Use cheap tiers for \
             simple work; free models cost nothing.</instructions>"
                .into(),
        );
        sections.push("</iteration>".into());
        sections.join("\n")
    }

    fn track_signature(&self, plan: &Plan) {
        let sig = action_signature(plan);
        let mut sigs = self.action_sigs.lock().unwrap();
        sigs.push_back(sig);
        if sigs.len() > SIG_HISTORY {
            sigs.pop_front();
        }
    }

    fn stuck_loop_warning(&self) -> Option<String> {
        let sigs = self.action_sigs.lock().unwrap();
        if sigs.len() >= SIG_REPEAT_THRESHOLD {
            let recent: Vec<&String> = sigs.iter().rev().take(SIG_REPEAT_THRESHOLD).collect();
            let first = recent[0];
            if first != "no_actions" && recent.iter().all(|s| *s == first) {
                return Some(format!(
                    "You have produced the identical action pattern ({first}) for \
                     {SIG_REPEAT_THRESHOLD} iterations. Stop repeating it: check whether \
                     the work is already done, try a different tool, or update your goals."
                ));
            }
        }
        let idle = sigs.iter().rev().take(5).filter(|s| *s == "no_actions").count();
        if idle >= 4 {
            return Some(
                "You have planned no actions for several iterations. Free models cost \
                 nothing; find productive work or set a long sleep."
                    .into(),
            );
        }
        None
    }
}

const PLAN_FORMAT: &str = r#"
## Response format
Respond with a single JSON object:
{"thinking": str, "status_message": str,
 "actions": [{"tool": str, "tier": str?, "parameters": obj, "halt_on_failure": bool?}],
 "chat_reply": str?, "short_term_goals": [str]?, "mid_term_goals": [str]?,
 "long_term_goals": [str]?,
 "memory_config": {"retrieval_count"?, "relevance_threshold"?, "decay_factor"?, "max_context_tokens"?}?,
 "next_sleep_seconds": number?}
"#;

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect::<String>() + "…"
    }
}

/// Short signature of a plan's actions, for loop detection.
fn action_signature(plan: &Plan) -> String {
    if plan.actions.is_empty() {
        return "no_actions".into();
    }
    plan.actions
        .iter()
        .take(5)
        .map(|a| {
            match a.parameters.get("path").and_then(|p| p.as_str()) {
                Some(path) => format!("{}:{path}", a.tool),
                None => a.tool.clone(),
            }
        })
        .collect::<Vec<_>>()
        .join("|")
}

// ---------------------------------------------------------------------------
// Plan parsing
// ---------------------------------------------------------------------------

/// Parse a model response into a plan. Tolerates code fences and leading
/// prose; requires `status_message` and `actions`.
pub fn parse_plan(content: &str) -> ParsedPlan {
    let cleaned = strip_fences(content.trim());

    if let Some(plan) = try_plan(cleaned) {
        return ParsedPlan::Valid(plan);
    }

    // Fall back to the outermost brace span.
    if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) {
        if end > start {
            if let Some(plan) = try_plan(&cleaned[start..=end]) {
                return ParsedPlan::Valid(plan);
            }
        }
    }

    // Last resort: repair a truncated object with closing brackets.
    if let Some(start) = cleaned.find('{') {
        let fragment = &cleaned[start..];
        for suffix in ["}", "]}", "\"]}"] {
            if let Some(plan) = try_plan(&format!("{fragment}{suffix}")) {
                warn!("Plan JSON repaired with '{suffix}'");
                return ParsedPlan::Valid(plan);
            }
        }
    }

    ParsedPlan::Invalid {
        reason: format!("Not a plan object: {}", clip(content, 160)),
    }
}

fn try_plan(text: &str) -> Option<Plan> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let obj = value.as_object()?;
    if !obj.get("status_message").map_or(false, |v| v.is_string()) {
        return None;
    }
    if !obj.get("actions").map_or(false, |v| v.is_array()) {
        return None;
    }
    serde_json::from_value(value).ok()
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string line, then the closing fence.
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_clean_plan() {
        let content = r#"{"thinking": "t", "status_message": "working",
            "actions": [{"tool": "note", "parameters": {"content": "x"}}],
            "next_sleep_seconds": 45}"#;
        let ParsedPlan::Valid(plan) = parse_plan(content) else {
            panic!("expected valid plan");
        };
        assert_eq!(plan.status_message, "working");
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.next_sleep_seconds, Some(45.0));
    }

    #[test]
    fn parses_a_fenced_plan() {
        let content = "```json\n{\"status_message\": \"ok\", \"actions\": []}\n```";
        assert!(matches!(parse_plan(content), ParsedPlan::Valid(_)));
    }

    #[test]
    fn parses_a_plan_wrapped_in_prose() {
        let content = "Sure, here is the plan:\n{\"status_message\": \"ok\", \"actions\": []}\nHope that helps!";
        assert!(matches!(parse_plan(content), ParsedPlan::Valid(_)));
    }

    #[test]
    fn repairs_a_truncated_plan() {
        let content = r#"{"status_message": "ok", "actions": []"#;
        assert!(matches!(parse_plan(content), ParsedPlan::Valid(_)));
    }

    #[test]
    fn missing_status_message_is_invalid() {
        let content = r#"{"actions": []}"#;
        assert!(matches!(parse_plan(content), ParsedPlan::Invalid { .. }));
    }

    #[test]
    fn missing_actions_is_invalid() {
        let content = r#"{"status_message": "ok"}"#;
        assert!(matches!(parse_plan(content), ParsedPlan::Invalid { .. }));
    }

    #[test]
    fn garbage_is_invalid_with_reason() {
        let ParsedPlan::Invalid { reason } = parse_plan("I would rather write a poem.") else {
            panic!("expected invalid");
        };
        assert!(reason.contains("Not a plan object"));
    }

    #[test]
    fn goal_updates_ride_the_plan() {
        let content = r#"{"status_message": "ok", "actions": [],
            "short_term_goals": ["a"], "long_term_goals": ["b", "c"]}"#;
        let ParsedPlan::Valid(plan) = parse_plan(content) else {
            panic!("expected valid plan");
        };
        assert_eq!(plan.short_term_goals.unwrap(), vec!["a"]);
        assert!(plan.mid_term_goals.is_none());
        assert_eq!(plan.long_term_goals.unwrap().len(), 2);
    }

    #[test]
    fn signature_tracks_tools_and_paths() {
        let plan = Plan {
            status_message: "s".into(),
            actions: vec![
                Action {
                    tool: "self_update".into(),
                    tier: None,
                    parameters: serde_json::json!({"path": "src/lib.rs"}),
                    halt_on_failure: false,
                },
                Action {
                    tool: "note".into(),
                    tier: None,
                    parameters: serde_json::json!({"content": "x"}),
                    halt_on_failure: false,
                },
            ],
            ..Default::default()
        };
        assert_eq!(action_signature(&plan), "self_update:src/lib.rs|note");
        assert_eq!(action_signature(&Plan::default()), "no_actions");
    }
}
