//! Tiered model routing with health- and budget-aware fallback.
//!
//! For a requested tier the router walks the ordered candidate list, skipping
//! providers that are credential-less, cooling down after failures, or
//! unaffordable. Retryable failures back off and retry in place, then fall
//! through to the next candidate; an exhausted tier degrades one step down
//! the ladder, bottoming out at the always-available local provider.

use crate::budget::BudgetTracker;
use crate::config::ModelRef;
use crate::llm::{FailureKind, LlmFailure, LlmReply, LlmRequest, Provider};
use crate::memory::BlobStore;
use crate::types::{BlobEventType, Tier};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Same-tier fallthrough limit.
const MAX_FALLBACK: usize = 3;

/// Retry attempts per provider for retryable failures.
const MAX_RETRIES: u32 = 3;

/// Consecutive non-retryable failures before a cool-down.
const UNHEALTHY_AFTER: u32 = 3;

/// Cool-down length for an unhealthy provider.
const COOLDOWN: Duration = Duration::from_secs(600);

/// Rolling health window size per provider.
const HEALTH_WINDOW: usize = 20;

#[derive(Debug, Default)]
struct Health {
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    window: VecDeque<bool>,
}

impl Health {
    fn healthy(&self, now: Instant) -> bool {
        self.cooldown_until.map_or(true, |until| now >= until)
    }

    fn record(&mut self, success: bool, retryable: bool, now: Instant) {
        self.window.push_back(success);
        if self.window.len() > HEALTH_WINDOW {
            self.window.pop_front();
        }
        if success {
            self.consecutive_failures = 0;
            self.cooldown_until = None;
        } else if !retryable {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= UNHEALTHY_AFTER {
                self.cooldown_until = Some(now + COOLDOWN);
            }
        }
    }
}

/// Routes completion requests across tiers and providers.
pub struct LlmRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    tiers: BTreeMap<Tier, Vec<ModelRef>>,
    budget: BudgetTracker,
    blob: BlobStore,
    health: Mutex<HashMap<String, Health>>,
    cancel: CancellationToken,
    call_timeout: Duration,
}

impl LlmRouter {
    pub fn new(
        providers: HashMap<String, Arc<dyn Provider>>,
        tiers: BTreeMap<Tier, Vec<ModelRef>>,
        budget: BudgetTracker,
        blob: BlobStore,
        cancel: CancellationToken,
        call_timeout: Duration,
    ) -> Self {
        Self {
            providers,
            tiers,
            budget,
            blob,
            health: Mutex::new(HashMap::new()),
            cancel,
            call_timeout,
        }
    }

    /// Route one completion through the ladder.
    pub async fn complete(
        &self,
        mut request: LlmRequest,
        purpose: &str,
    ) -> Result<LlmReply, LlmFailure> {
        let requested = request.tier;
        request.tier = self.effective_tier(requested).await;
        if request.tier != requested {
            info!(
                "Tier downgraded by budget: {} -> {}",
                requested, request.tier
            );
        }

        let mut tier = request.tier;
        let mut last_failure =
            LlmFailure::new(FailureKind::Budget, "router", "No eligible provider");

        loop {
            let candidates = self.tiers.get(&tier).cloned().unwrap_or_default();
            let mut tried = 0usize;

            for candidate in candidates {
                if tried >= MAX_FALLBACK {
                    break;
                }
                let Some(provider) = self.providers.get(&candidate.provider) else {
                    continue;
                };
                if !provider.available() {
                    debug!("Skipping {} (no credential)", candidate.provider);
                    continue;
                }
                if !self.is_healthy(&candidate.provider).await {
                    debug!("Skipping {} (cooling down)", candidate.provider);
                    continue;
                }
                if !self.affordable(&candidate.provider, &request).await {
                    warn!(
                        "Skipping {} (budget would be exceeded)",
                        candidate.provider
                    );
                    continue;
                }

                tried += 1;
                match self
                    .attempt(provider.as_ref(), &candidate, &request, tier, purpose)
                    .await
                {
                    Ok(reply) => return Ok(reply),
                    Err(failure) => {
                        if failure.kind == FailureKind::Cancelled {
                            return Err(failure);
                        }
                        last_failure = failure;
                    }
                }
            }

            match tier.degrade() {
                Some(next) => {
                    debug!("Tier {} exhausted, degrading to {}", tier, next);
                    tier = next;
                }
                None => {
                    self.blob
                        .append(
                            BlobEventType::Error,
                            &format!("All providers failed: {last_failure}"),
                            serde_json::json!({"purpose": purpose}),
                        )
                        .ok();
                    return Err(last_failure);
                }
            }
        }
    }

    /// Budget-driven tier ceiling; the coding ladder is left alone because
    /// its candidates are mostly free.
    async fn effective_tier(&self, requested: Tier) -> Tier {
        if requested.is_coding() || requested == Tier::LocalOnly {
            return requested;
        }
        let recommended = self
            .budget
            .recommended_tier()
            .await
            .unwrap_or(Tier::Level1);
        if ladder_rank(recommended) > ladder_rank(requested) {
            recommended
        } else {
            requested
        }
    }

    async fn is_healthy(&self, provider: &str) -> bool {
        let health = self.health.lock().await;
        health
            .get(provider)
            .map_or(true, |h| h.healthy(Instant::now()))
    }

    async fn affordable(&self, provider: &str, request: &LlmRequest) -> bool {
        let estimate = match self
            .budget
            .estimate(
                provider,
                request.estimated_input_tokens(),
                request.max_tokens,
            )
            .await
        {
            Ok(cost) => cost,
            Err(_) => return false,
        };
        self.budget
            .can_afford(provider, &estimate)
            .await
            .unwrap_or(false)
    }

    /// One provider: dispatch with in-place retries, then settle the charge.
    async fn attempt(
        &self,
        provider: &dyn Provider,
        candidate: &ModelRef,
        request: &LlmRequest,
        tier: Tier,
        purpose: &str,
    ) -> Result<LlmReply, LlmFailure> {
        self.blob
            .append(
                BlobEventType::LlmRequest,
                &format!(
                    "provider={} model={} tier={} purpose={}",
                    candidate.provider, candidate.model, tier, purpose
                ),
                serde_json::json!({
                    "provider": candidate.provider,
                    "model": candidate.model,
                    "tier": tier.to_string(),
                    "messages": request.messages.len(),
                }),
            )
            .ok();

        let started = Instant::now();
        let mut failure: Option<LlmFailure> = None;

        for attempt in 0..MAX_RETRIES {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(LlmFailure::new(
                        FailureKind::Cancelled,
                        &candidate.provider,
                        "Shutdown in progress",
                    ));
                }
                result = tokio::time::timeout(
                    self.call_timeout,
                    provider.complete(&candidate.model, request),
                ) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(LlmFailure::new(
                        FailureKind::Network,
                        &candidate.provider,
                        format!("Timed out after {:?}", self.call_timeout),
                    )),
                },
            };

            match outcome {
                Ok(completion) => {
                    self.record_health(&candidate.provider, true, false).await;
                    let charge = self
                        .budget
                        .charge(
                            &candidate.provider,
                            completion.usage.input_tokens,
                            completion.usage.output_tokens,
                        )
                        .await
                        .map_err(|e| {
                            LlmFailure::new(
                                FailureKind::Budget,
                                &candidate.provider,
                                e.to_string(),
                            )
                        })?;
                    if charge.is_over_cap() {
                        warn!("Charge pushed the month over its cap");
                    }

                    let reply = LlmReply {
                        provider: candidate.provider.clone(),
                        model: candidate.model.clone(),
                        content: completion.content,
                        input_tokens: completion.usage.input_tokens,
                        output_tokens: completion.usage.output_tokens,
                        cost_estimate: charge.cost().amount,
                        latency_ms: started.elapsed().as_millis() as u64,
                    };
                    self.blob
                        .append(
                            BlobEventType::LlmResponse,
                            &format!(
                                "provider={} model={} tokens={}",
                                reply.provider,
                                reply.model,
                                reply.input_tokens + reply.output_tokens
                            ),
                            serde_json::json!({
                                "provider": reply.provider,
                                "model": reply.model,
                                "input_tokens": reply.input_tokens,
                                "output_tokens": reply.output_tokens,
                                "cost": reply.cost_estimate,
                                "latency_ms": reply.latency_ms,
                            }),
                        )
                        .ok();
                    return Ok(reply);
                }
                Err(err) => {
                    let retryable = err.retryable();
                    warn!(
                        "Provider {} failed (attempt {}/{}): {}",
                        candidate.provider,
                        attempt + 1,
                        MAX_RETRIES,
                        err
                    );
                    failure = Some(err);
                    if !retryable || attempt + 1 == MAX_RETRIES {
                        break;
                    }
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }

        let failure = failure.unwrap_or_else(|| {
            LlmFailure::new(FailureKind::Network, &candidate.provider, "No attempt ran")
        });
        self.record_health(&candidate.provider, false, failure.retryable())
            .await;
        // The failed call still consumed a slot; settle the charge so
        // request-currency accounting sees it.
        self.budget
            .charge(&candidate.provider, 0, 0)
            .await
            .ok();
        self.blob
            .append(
                BlobEventType::Error,
                &format!("LLM call failed: {failure}"),
                serde_json::json!({
                    "provider": candidate.provider,
                    "model": candidate.model,
                    "kind": failure.kind,
                }),
            )
            .ok();
        Err(failure)
    }

    async fn record_health(&self, provider: &str, success: bool, retryable: bool) {
        let mut health = self.health.lock().await;
        health
            .entry(provider.to_string())
            .or_default()
            .record(success, retryable, Instant::now());
    }
}

/// Position along the general degradation ladder.
fn ladder_rank(tier: Tier) -> u8 {
    match tier {
        Tier::Level1 | Tier::CodingLevel1 => 0,
        Tier::Level2 | Tier::CodingLevel2 => 1,
        Tier::Level3 | Tier::CodingLevel3 => 2,
        Tier::LocalOnly => 3,
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1u64 << attempt.min(5));
    let jitter = rand::thread_rng().gen_range(0..500u64);
    base + Duration::from_millis(jitter)
}
