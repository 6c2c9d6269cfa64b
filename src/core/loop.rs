//! The core loop: plan, validate, execute, remember, sleep, repeat.
//!
//! One director task owns the iteration counter and the pause flag. The
//! adaptive sleep between iterations is the only interruptible suspension
//! point; wake signals, chat enqueues, and shutdown all land there.

use crate::budget::{BudgetSummary, BudgetTracker};
use crate::config::VigilConfig;
use crate::core::{ChatReply, PendingChat};
use crate::exec::Executor;
use crate::listeners::telegram::TelegramSender;
use crate::memory::{BlobStore, MemoryEntry, NotePad, VectorStore};
use crate::planner::Planner;
use crate::state::Database;
use crate::types::*;
use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Maintenance cadence, in iterations.
const MAINTENANCE_EVERY: u64 = 10;
const DEDUP_EVERY: u64 = 50;

/// Importance below which an expired memory is dropped.
const PRUNE_IMPORTANCE: f64 = 0.05;

/// Tools whose outcomes are worth long-term memory.
const WORTH_STORING: &[&str] = &["coding_agent", "http_request", "self_update", "send_telegram"];

pub struct CoreLoop {
    pub(crate) config: VigilConfig,
    pub(crate) db: Arc<Mutex<Database>>,
    pub(crate) planner: Arc<Planner>,
    pub(crate) executor: Arc<Executor>,
    pub(crate) budget: BudgetTracker,
    pub(crate) blob: BlobStore,
    pub(crate) vector: Arc<Mutex<VectorStore>>,
    pub(crate) notes: NotePad,
    pub(crate) chat_rx: mpsc::Receiver<PendingChat>,
    pub(crate) wake: Arc<Notify>,
    pub(crate) broadcast: broadcast::Sender<Value>,
    pub(crate) cancel: CancellationToken,
    pub(crate) telegram: Option<TelegramSender>,
    /// Exposed to `/status` as the current sleep.
    pub(crate) next_sleep: Arc<RwLock<f64>>,
    pub(crate) quiet_iterations: u32,
}

impl CoreLoop {
    /// Run until shutdown. Never returns early on iteration errors.
    pub async fn run(mut self) -> Result<()> {
        info!("Core loop starting");
        self.blob
            .append(BlobEventType::System, "core_loop_started", Value::Null)
            .ok();

        while !self.cancel.is_cancelled() {
            // Pause halts at the start of an iteration, never mid-flight.
            let paused = {
                let db = self.db.lock().await;
                db.is_paused().unwrap_or(false)
            };
            if paused {
                self.emit("paused", json!({}));
                self.interruptible_sleep(5.0).await;
                continue;
            }

            let sleep_seconds = match self.iteration().await {
                Ok(seconds) => seconds,
                Err(err) => {
                    error!("Iteration failed: {err:#}");
                    self.blob
                        .append(
                            BlobEventType::Error,
                            &format!("Iteration error: {err:#}"),
                            json!({"kind": "state_io"}),
                        )
                        .ok();
                    self.emit("error", json!({"error": err.to_string()}));
                    self.config.default_sleep_seconds
                }
            };

            *self.next_sleep.write().await = sleep_seconds;
            self.interruptible_sleep(sleep_seconds).await;
        }

        info!("Core loop stopped");
        Ok(())
    }

    /// One full iteration. Returns the sleep to take afterwards.
    async fn iteration(&mut self) -> Result<f64> {
        let n = {
            let db = self.db.lock().await;
            db.increment_iteration()?
        };
        let started_at = Utc::now();
        info!("Iteration {n} started");
        self.emit("running", json!({"iteration": n}));

        if self.budget.maybe_rollover().await? {
            self.blob
                .append(BlobEventType::System, "budget_month_rollover", Value::Null)
                .ok();
        }

        // Drain pending chat (bounded), including rows persisted by a
        // previous process that never consumed them.
        let mut pending = self.drain_chat().await?;

        let (snapshot, chat_history, notes) = {
            let db = self.db.lock().await;
            (db.snapshot()?, db.chat_history(24)?, db.notes()?)
        };
        let budget_status = self.budget.status().await?;

        let chat_records: Vec<ChatRecord> = pending
            .iter()
            .map(|p| ChatRecord {
                id: p.id,
                role: ChatRole::Creator,
                content: p.message.clone(),
                timestamp: started_at,
                channel: p.channel,
                metadata: Value::Null,
            })
            .collect();

        let outcome = self
            .planner
            .plan(
                &snapshot,
                &budget_status,
                &self.executor.registry().names(),
                &chat_records,
                &chat_history,
                &notes,
            )
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                // Router exhausted every ladder: apologize and retreat.
                self.apologize(&mut pending).await;
                self.blob
                    .append(
                        BlobEventType::Error,
                        &format!("Planning failed: {err:#}"),
                        json!({"kind": "llm_network", "iteration": n}),
                    )
                    .ok();
                return Ok(self.config.default_sleep_seconds);
            }
        };

        let plan = match outcome.parsed {
            ParsedPlan::Valid(ref plan) => plan.clone(),
            ParsedPlan::Invalid { ref reason } => {
                self.blob
                    .append(
                        BlobEventType::Error,
                        &format!("Plan parse failed: {reason}"),
                        json!({"kind": "parse", "iteration": n}),
                    )
                    .ok();
                self.apologize(&mut pending).await;
                self.record_iteration(
                    n,
                    started_at,
                    &outcome,
                    &Plan {
                        status_message: "Plan parse failed".into(),
                        ..Default::default()
                    },
                    None,
                    self.config.default_sleep_seconds,
                )
                .await;
                return Ok(self.config.default_sleep_seconds);
            }
        };

        self.blob
            .append(
                BlobEventType::Planning,
                &serde_json::to_string(&plan)?,
                json!({
                    "iteration": n,
                    "model": outcome.model,
                    "provider": outcome.provider,
                    "tokens": outcome.usage.total(),
                    "action_count": plan.actions.len(),
                    "has_chat": !pending.is_empty(),
                }),
            )
            .ok();
        self.emit(
            "planning",
            json!({
                "iteration": n,
                "status_message": plan.status_message,
                "thinking": clip(&plan.thinking, 200),
            }),
        );

        // Execute (validation happens inside, per action).
        let results = if plan.actions.is_empty() {
            Vec::new()
        } else {
            let results = self.executor.execute_plan(&plan.actions, n).await;
            self.emit(
                "executing",
                json!({"iteration": n, "actions": plan.actions.len(), "results": results.len()}),
            );
            results
        };

        // Feed outcomes back: working memory, scratch pad, vector memory.
        self.planner.remember_results(&results);
        self.remember_in_vector(&results).await?;
        if !results.is_empty() {
            let ok = results.iter().filter(|r| r.success).count();
            let tools: Vec<&str> = results.iter().map(|r| r.tool.as_str()).collect();
            self.notes
                .add(
                    &format!("iter {n}: {ok}/{} ok [{}]", results.len(), tools.join(", ")),
                    n,
                )
                .await?;
        }

        // Goal updates are atomic over all three horizons.
        let mut goals = snapshot.goals.clone();
        let mut goals_changed = false;
        if let Some(short) = &plan.short_term_goals {
            goals.short_term = short.clone();
            goals_changed = true;
        }
        if let Some(mid) = &plan.mid_term_goals {
            goals.mid_term = mid.clone();
            goals_changed = true;
        }
        if let Some(long) = &plan.long_term_goals {
            goals.long_term = long.clone();
            goals_changed = true;
        }

        {
            let db = self.db.lock().await;
            if goals_changed {
                db.set_goals(&goals)?;
                info!("Goals updated");
            }
            if let Some(patch) = &plan.memory_config {
                let mut config = snapshot.memory_config;
                config.apply(patch);
                db.set_memory_config(&config)?;
                info!("Memory config updated");
            }
            db.set_active_task(Some(&plan.status_message))?;
        }

        // Deliver the chat reply through each originating channel, in
        // enqueue order.
        let chat_reply = self.deliver_replies(&plan, &outcome, &mut pending).await?;

        if n % MAINTENANCE_EVERY == 0 {
            self.maintenance(n, snapshot.memory_config).await?;
        }

        let had_actions = !plan.actions.is_empty();
        if had_actions || !pending.is_empty() {
            self.quiet_iterations = 0;
        } else {
            self.quiet_iterations = self.quiet_iterations.saturating_add(1);
        }
        let sleep_seconds = compute_sleep(
            &self.config,
            plan.next_sleep_seconds,
            &budget_status,
            had_actions,
            !pending.is_empty(),
            self.quiet_iterations,
        );

        self.record_iteration(n, started_at, &outcome, &plan, chat_reply, sleep_seconds)
            .await;

        self.blob
            .append(
                BlobEventType::System,
                "iteration_complete",
                json!({
                    "iteration": n,
                    "actions": plan.actions.len(),
                    "results": results.len(),
                    "budget_remaining": budget_status.remaining_usd,
                    "next_sleep": sleep_seconds,
                }),
            )
            .ok();
        self.emit(
            "idle",
            json!({
                "iteration": n,
                "status_message": plan.status_message,
                "next_wake_seconds": sleep_seconds,
                "model": outcome.model,
                "provider": outcome.provider,
                "budget_remaining": budget_status.remaining_usd,
            }),
        );
        info!(
            "Iteration {n} complete: {} actions, sleeping {sleep_seconds:.0}s",
            plan.actions.len()
        );
        Ok(sleep_seconds)
    }

    /// Pull up to the batch limit from the queue, merge in persisted rows a
    /// previous process left unconsumed, and advance the cursor.
    async fn drain_chat(&mut self) -> Result<Vec<PendingChat>> {
        let limit = self.config.chat_batch_limit;
        let mut pending = Vec::new();
        while pending.len() < limit {
            match self.chat_rx.try_recv() {
                Ok(chat) => pending.push(chat),
                Err(_) => break,
            }
        }

        let db = self.db.lock().await;
        let cursor = db.snapshot()?.chat_cursor;
        let known: HashSet<i64> = pending.iter().map(|p| p.id).collect();
        for record in db.chat_after_cursor(cursor, limit)? {
            if !known.contains(&record.id) && pending.len() < limit {
                pending.push(PendingChat {
                    id: record.id,
                    message: record.content,
                    channel: record.channel,
                    reply: None,
                });
            }
        }
        pending.sort_by_key(|p| p.id);
        if let Some(max_id) = pending.iter().map(|p| p.id).max() {
            db.advance_chat_cursor(max_id)?;
        }
        Ok(pending)
    }

    /// Store notable outcomes in long-term memory.
    async fn remember_in_vector(&self, results: &[ToolOutcome]) -> Result<()> {
        let vector = self.vector.lock().await;
        for result in results {
            if !WORTH_STORING.contains(&result.tool.as_str()) {
                continue;
            }
            if result.success && !result.output.is_empty() {
                vector.add(&MemoryEntry::new(
                    format!("[{}] {}", result.tool, clip(&result.output, 500)),
                    0.5,
                    format!("tool:{}", result.tool),
                ))?;
            } else if let Some(error) = &result.error {
                vector.add(&MemoryEntry::new(
                    format!("[{} FAILED] {}", result.tool, clip(error, 300)),
                    0.6,
                    format!("tool:{}:error", result.tool),
                ))?;
            }
        }
        Ok(())
    }

    /// Deliver `chat_reply` to every waiting channel; persists the agent
    /// side of the conversation. Returns the delivered text.
    async fn deliver_replies(
        &self,
        plan: &Plan,
        outcome: &crate::planner::PlanOutcome,
        pending: &mut Vec<PendingChat>,
    ) -> Result<Option<String>> {
        if pending.is_empty() {
            return Ok(None);
        }

        // Fall back to thinking/status when the model forgot the field.
        let reply_text = match &plan.chat_reply {
            Some(reply) if !reply.is_empty() => reply.clone(),
            _ if !plan.thinking.is_empty() => clip(&plan.thinking, 2000),
            _ => plan.status_message.clone(),
        };

        let channel = pending.last().map(|p| p.channel).unwrap_or(Channel::Web);
        {
            let db = self.db.lock().await;
            db.append_chat(ChatRole::Agent, &reply_text, channel, &Value::Null)?;
        }
        self.blob
            .append(
                BlobEventType::ChatAgent,
                &reply_text,
                json!({"channel": channel.to_string()}),
            )
            .ok();

        // Conversation turns are memorable.
        {
            let vector = self.vector.lock().await;
            for chat in pending.iter() {
                vector.add(&MemoryEntry::new(
                    format!("Creator said: {}", clip(&chat.message, 300)),
                    0.7,
                    "chat:creator",
                ))?;
            }
            vector.add(&MemoryEntry::new(
                format!("I replied: {}", clip(&reply_text, 300)),
                0.6,
                "chat:agent",
            ))?;
        }

        let reply = ChatReply {
            reply: reply_text.clone(),
            model: outcome.model.clone(),
            provider: outcome.provider.clone(),
            tokens_used: outcome.usage.total(),
        };
        for chat in pending.iter_mut() {
            if let Some(tx) = chat.reply.take() {
                tx.send(reply.clone()).ok();
            }
            if chat.channel == Channel::Telegram {
                if let Some(telegram) = &self.telegram {
                    if let Err(err) = telegram.send(&reply_text).await {
                        warn!("Telegram reply failed: {err:#}");
                    }
                }
            }
        }
        info!("Chat replies delivered ({})", pending.len());
        Ok(Some(reply_text))
    }

    /// Synthetic apology when planning itself failed with chat waiting.
    async fn apologize(&self, pending: &mut Vec<PendingChat>) {
        if pending.is_empty() {
            return;
        }
        let text = "Sorry, I hit an internal problem while processing your \
                    message. I've logged it and will retry shortly.";
        let reply = ChatReply {
            reply: text.into(),
            model: String::new(),
            provider: String::new(),
            tokens_used: 0,
        };
        {
            let db = self.db.lock().await;
            db.append_chat(ChatRole::Agent, text, Channel::Web, &Value::Null)
                .ok();
        }
        self.blob
            .append(BlobEventType::ChatAgent, text, json!({"synthetic": true}))
            .ok();
        for chat in pending.iter_mut() {
            if let Some(tx) = chat.reply.take() {
                tx.send(reply.clone()).ok();
            }
        }
    }

    /// Every tenth iteration: expire notes, decay and prune memories.
    async fn maintenance(&self, n: u64, config: MemoryConfig) -> Result<()> {
        let evicted = self.notes.expire().await?;
        let (decayed, pruned, deduped) = {
            let vector = self.vector.lock().await;
            let decayed = vector.decay(config.decay_factor as f64)?;
            let pruned = vector.prune_expired(Utc::now(), PRUNE_IMPORTANCE)?;
            let deduped = if n % DEDUP_EVERY == 0 {
                vector.deduplicate()?
            } else {
                0
            };
            (decayed, pruned, deduped)
        };
        info!(
            "Maintenance: {evicted} notes evicted, {decayed} decayed, \
             {pruned} pruned, {deduped} deduped"
        );
        Ok(())
    }

    async fn record_iteration(
        &self,
        n: u64,
        started_at: chrono::DateTime<Utc>,
        outcome: &crate::planner::PlanOutcome,
        plan: &Plan,
        chat_reply: Option<String>,
        next_sleep_s: f64,
    ) {
        let record = IterationRecord {
            n,
            started_at,
            model: outcome.model.clone(),
            provider: outcome.provider.clone(),
            tokens_in: outcome.usage.input_tokens,
            tokens_out: outcome.usage.output_tokens,
            cost: outcome.cost,
            thinking: clip(&plan.thinking, 2000),
            status_message: plan.status_message.clone(),
            actions: plan
                .actions
                .iter()
                .map(|a| ActionRecord {
                    tool: a.tool.clone(),
                    tier: a.tier,
                    parameters_keys: a.parameter_keys(),
                })
                .collect(),
            chat_reply,
            next_sleep_s,
        };
        let db = self.db.lock().await;
        if let Err(err) = db.save_iteration(&record) {
            error!("Failed to persist iteration record: {err:#}");
        }
    }

    /// Sleep, cut short by wake signals or shutdown.
    async fn interruptible_sleep(&self, seconds: f64) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))) => {}
            _ = self.wake.notified() => {
                info!("Sleep interrupted by wake signal");
            }
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Fire-and-forget broadcast to WS subscribers.
    fn emit(&self, status: &str, mut extra: Value) {
        if let Value::Object(map) = &mut extra {
            map.insert("type".into(), "state_update".into());
            map.insert("status".into(), status.into());
            map.insert("timestamp".into(), Utc::now().to_rfc3339().into());
        }
        self.broadcast.send(extra).ok();
    }
}

/// Clamp the planner's requested sleep, or fall back to the pacing
/// heuristic: short while active or chatting, stretching out as quiet
/// iterations accumulate.
fn compute_sleep(
    config: &VigilConfig,
    requested: Option<f64>,
    budget: &BudgetSummary,
    had_actions: bool,
    had_chat: bool,
    quiet_iterations: u32,
) -> f64 {
    let min = config.min_sleep_seconds;
    let max = config.max_sleep_seconds;

    if let Some(requested) = requested {
        // With free providers in the ladder there is no reason to vanish
        // for an hour; cap the requested sleep.
        let effective_max = if budget.has_free_provider() {
            120.0_f64.clamp(min, max)
        } else {
            max
        };
        return requested.clamp(min, effective_max);
    }

    if had_chat || had_actions {
        return config.default_sleep_seconds.clamp(min, max);
    }
    if budget.remaining_usd <= 1.0 && !budget.has_free_provider() {
        return max;
    }
    match quiet_iterations {
        0 => config.default_sleep_seconds.clamp(min, max),
        1..=4 => 120.0_f64.clamp(min, max),
        _ => max,
    }
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect::<String>() + "…"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::ProviderRow;
    use crate::budget::{Currency, ProviderTier};

    fn config() -> VigilConfig {
        VigilConfig::default()
    }

    fn budget(free: bool, remaining: f64) -> BudgetSummary {
        let providers = if free {
            vec![ProviderRow {
                name: "free".into(),
                tier: ProviderTier::Free,
                currency: Currency::Requests,
                known_balance: None,
                spent_tracked: 0.0,
                estimated_remaining: None,
                available: true,
            }]
        } else {
            Vec::new()
        };
        BudgetSummary {
            monthly_cap_usd: 100.0,
            spent_this_month_usd: 100.0 - remaining,
            remaining_usd: remaining,
            percent_used: 100.0 - remaining,
            providers,
        }
    }

    #[test]
    fn requested_sleep_is_clamped_to_bounds() {
        let cfg = config();
        assert_eq!(
            compute_sleep(&cfg, Some(2.0), &budget(false, 50.0), true, false, 0),
            cfg.min_sleep_seconds
        );
        assert_eq!(
            compute_sleep(&cfg, Some(90_000.0), &budget(false, 50.0), true, false, 0),
            cfg.max_sleep_seconds
        );
    }

    #[test]
    fn free_providers_cap_requested_sleep() {
        let cfg = config();
        assert_eq!(
            compute_sleep(&cfg, Some(3600.0), &budget(true, 50.0), false, false, 0),
            120.0
        );
    }

    #[test]
    fn active_or_chatting_keeps_short_cadence() {
        let cfg = config();
        assert_eq!(
            compute_sleep(&cfg, None, &budget(false, 50.0), true, false, 0),
            cfg.default_sleep_seconds
        );
        assert_eq!(
            compute_sleep(&cfg, None, &budget(false, 50.0), false, true, 3),
            cfg.default_sleep_seconds
        );
    }

    #[test]
    fn quiet_iterations_stretch_toward_max() {
        let cfg = config();
        assert_eq!(
            compute_sleep(&cfg, None, &budget(false, 50.0), false, false, 2),
            120.0
        );
        assert_eq!(
            compute_sleep(&cfg, None, &budget(false, 50.0), false, false, 9),
            cfg.max_sleep_seconds
        );
    }

    #[test]
    fn broke_with_no_free_providers_sleeps_long() {
        let cfg = config();
        assert_eq!(
            compute_sleep(&cfg, None, &budget(false, 0.5), false, false, 0),
            cfg.max_sleep_seconds
        );
    }
}
