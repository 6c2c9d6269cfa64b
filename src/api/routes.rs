//! HTTP route handlers.

use crate::api::{ApiError, AppState};
use crate::budget::{Currency, ProviderRecord, ProviderTier};
use crate::types::{Channel, GoalSet, MemoryConfigPatch};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Json;
use chrono::Duration;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration as StdDuration;

type ApiResult = Result<Json<Value>, ApiError>;

/// Bearer-token check for the creator-gated paths.
fn is_creator(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.config.creator_token else {
        return false;
    };
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map_or(false, |token| token == expected)
}

/// Mutating routes require the token only when one is configured.
fn check_mutation_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if state.config.creator_token.is_some() && !is_creator(state, headers) {
        return Err(ApiError::unauthorized());
    }
    Ok(())
}

pub async fn health() -> Json<Value> {
    Json(json!({"ok": true}))
}

pub async fn status(State(state): State<Arc<AppState>>) -> ApiResult {
    let snapshot = {
        let db = state.db.lock().await;
        db.snapshot()?
    };
    let next_sleep = *state.next_sleep.read().await;
    Ok(Json(json!({
        "directive": snapshot.directive,
        "short_term_goals": snapshot.goals.short_term,
        "mid_term_goals": snapshot.goals.mid_term,
        "long_term_goals": snapshot.goals.long_term,
        "active_task": snapshot.active_task,
        "iteration": snapshot.iteration,
        "paused": snapshot.paused,
        "current_sleep_seconds": next_sleep,
        "started_at": snapshot.started_at,
    })))
}

pub async fn budget(State(state): State<Arc<AppState>>) -> ApiResult {
    let status = state.budget.status().await?;
    Ok(Json(serde_json::to_value(status).map_err(|e| ApiError::internal(e.into()))?))
}

#[derive(Deserialize)]
pub struct OverrideBody {
    pub new_cap_usd: f64,
}

/// Rule 7: only the authenticated creator path may override the cap.
pub async fn budget_override(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<OverrideBody>,
) -> ApiResult {
    if !is_creator(&state, &headers) {
        return Err(ApiError::unauthorized());
    }
    state.budget.override_cap(body.new_cap_usd).await?;
    Ok(Json(json!({"ok": true, "new_cap_usd": body.new_cap_usd})))
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

pub async fn memory_stats(State(state): State<Arc<AppState>>) -> ApiResult {
    let vector_stats = {
        let vector = state.vector.lock().await;
        vector.stats()?
    };
    let blob_stats = state.blob.stats()?;
    let note_count = state.notes.count().await?;
    Ok(Json(json!({
        "vector": vector_stats,
        "blob": blob_stats,
        "short_term_notes": note_count,
    })))
}

#[derive(Deserialize)]
pub struct VectorQuery {
    pub query: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn memory_vector(
    State(state): State<Arc<AppState>>,
    Query(params): Query<VectorQuery>,
) -> ApiResult {
    let limit = params.limit.unwrap_or(20).min(200);
    let offset = params.offset.unwrap_or(0);
    let vector = state.vector.lock().await;
    let body = match params.query.as_deref().filter(|q| !q.trim().is_empty()) {
        Some(query) => {
            let hits = vector.search(query, limit, 0.0)?;
            serde_json::to_value(hits).map_err(|e| ApiError::internal(e.into()))?
        }
        None => {
            let entries = vector.list(limit, offset)?;
            serde_json::to_value(entries).map_err(|e| ApiError::internal(e.into()))?
        }
    };
    Ok(Json(body))
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

pub async fn memory_blob(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitQuery>,
) -> ApiResult {
    let events = state.blob.read_recent(params.limit.unwrap_or(50).min(500))?;
    Ok(Json(serde_json::to_value(events).map_err(|e| ApiError::internal(e.into()))?))
}

pub async fn memory_working(State(state): State<Arc<AppState>>) -> ApiResult {
    let working = state.working.read().await;
    match working.as_ref() {
        Some(context) => Ok(Json(
            serde_json::to_value(context).map_err(|e| ApiError::internal(e.into()))?,
        )),
        None => Ok(Json(json!({"available": false}))),
    }
}

pub async fn memory_short_term(State(state): State<Arc<AppState>>) -> ApiResult {
    let notes = state.notes.list().await?;
    Ok(Json(serde_json::to_value(notes).map_err(|e| ApiError::internal(e.into()))?))
}

pub async fn memory_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(patch): Json<MemoryConfigPatch>,
) -> ApiResult {
    check_mutation_auth(&state, &headers)?;
    let db = state.db.lock().await;
    let mut config = db.snapshot()?.memory_config;
    config.apply(&patch);
    db.set_memory_config(&config)?;
    Ok(Json(serde_json::to_value(config).map_err(|e| ApiError::internal(e.into()))?))
}

// ---------------------------------------------------------------------------
// Directive, goals, control
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct DirectiveBody {
    pub directive: String,
}

pub async fn set_directive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<DirectiveBody>,
) -> ApiResult {
    check_mutation_auth(&state, &headers)?;
    if body.directive.trim().is_empty() {
        return Err(ApiError::bad_request("Directive cannot be empty"));
    }
    let db = state.db.lock().await;
    db.set_directive(body.directive.trim())?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
pub struct GoalsBody {
    #[serde(default)]
    pub short_term: Option<Vec<String>>,
    #[serde(default)]
    pub mid_term: Option<Vec<String>>,
    #[serde(default)]
    pub long_term: Option<Vec<String>>,
}

pub async fn set_goals(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<GoalsBody>,
) -> ApiResult {
    check_mutation_auth(&state, &headers)?;
    let db = state.db.lock().await;
    let current = db.snapshot()?.goals;
    let goals = GoalSet {
        short_term: body.short_term.unwrap_or(current.short_term),
        mid_term: body.mid_term.unwrap_or(current.mid_term),
        long_term: body.long_term.unwrap_or(current.long_term),
    };
    db.set_goals(&goals)?;
    Ok(Json(serde_json::to_value(goals).map_err(|e| ApiError::internal(e.into()))?))
}

pub async fn pause(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    check_mutation_auth(&state, &headers)?;
    let db = state.db.lock().await;
    db.set_paused(true)?;
    Ok(Json(json!({"paused": true})))
}

pub async fn resume(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    check_mutation_auth(&state, &headers)?;
    {
        let db = state.db.lock().await;
        db.set_paused(false)?;
    }
    state.chat.wake();
    Ok(Json(json!({"paused": false})))
}

pub async fn wake(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    check_mutation_auth(&state, &headers)?;
    state.chat.wake();
    Ok(Json(json!({"woken": true})))
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ProviderBody {
    pub name: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub known_balance: Option<f64>,
    #[serde(default)]
    pub api_key_ref: Option<String>,
    #[serde(default)]
    pub input_per_1k: Option<f64>,
    #[serde(default)]
    pub output_per_1k: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

async fn upsert_provider(
    state: &AppState,
    name: &str,
    body: ProviderBody,
) -> Result<ProviderRecord, ApiError> {
    let existing = state.budget.provider(name).await?;
    let mut record = existing.unwrap_or(ProviderRecord {
        name: name.to_string(),
        tier: ProviderTier::Unknown,
        currency: Currency::Usd,
        known_balance: None,
        balance_updated_at: None,
        spent_tracked: 0.0,
        api_key_ref: String::new(),
        input_per_1k: 0.0,
        output_per_1k: 0.0,
        notes: None,
    });

    if let Some(tier) = body.tier {
        record.tier = tier
            .parse()
            .map_err(|e: String| ApiError::bad_request(e))?;
    }
    if let Some(currency) = body.currency {
        record.currency = currency
            .parse()
            .map_err(|e: String| ApiError::bad_request(e))?;
    }
    if let Some(api_key_ref) = body.api_key_ref {
        record.api_key_ref = api_key_ref;
    }
    if let Some(input) = body.input_per_1k {
        record.input_per_1k = input;
    }
    if let Some(output) = body.output_per_1k {
        record.output_per_1k = output;
    }
    if let Some(notes) = body.notes {
        record.notes = Some(notes);
    }
    state.budget.register_provider(&record).await?;

    // Balance updates go through the tracker so spend tracking restarts.
    if let Some(balance) = body.known_balance {
        state
            .budget
            .set_known_balance(name, balance, record.currency)
            .await?;
    }
    Ok(state.budget.provider(name).await?.unwrap_or(record))
}

pub async fn add_provider(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ProviderBody>,
) -> ApiResult {
    check_mutation_auth(&state, &headers)?;
    let name = body.name.clone();
    if name.trim().is_empty() {
        return Err(ApiError::bad_request("Provider name required"));
    }
    let record = upsert_provider(&state, &name, body).await?;
    Ok(Json(serde_json::to_value(record).map_err(|e| ApiError::internal(e.into()))?))
}

pub async fn update_provider(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ProviderBody>,
) -> ApiResult {
    check_mutation_auth(&state, &headers)?;
    if state.budget.provider(&name).await?.is_none() {
        return Err(ApiError::not_found(format!("Unknown provider: {name}")));
    }
    let record = upsert_provider(&state, &name, body).await?;
    Ok(Json(serde_json::to_value(record).map_err(|e| ApiError::internal(e.into()))?))
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// Synchronous chat: enqueue, wait for the loop's reply, bounded.
const CHAT_REPLY_TIMEOUT: StdDuration = StdDuration::from_secs(90);

#[derive(Deserialize)]
pub struct ChatBody {
    pub message: String,
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> ApiResult {
    check_mutation_auth(&state, &headers)?;
    if body.message.trim().is_empty() {
        return Err(ApiError::bad_request("Message cannot be empty"));
    }

    let receiver = state.chat.enqueue(body.message.trim(), Channel::Web).await?;
    match tokio::time::timeout(CHAT_REPLY_TIMEOUT, receiver).await {
        Ok(Ok(reply)) => Ok(Json(json!({
            "reply": reply.reply,
            "model": reply.model,
            "provider": reply.provider,
            "tokens_used": reply.tokens_used,
        }))),
        _ => Ok(Json(json!({
            "reply": "I'm still working on that — check /chat/history shortly.",
            "model": "",
            "provider": "",
            "tokens_used": 0,
        }))),
    }
}

pub async fn chat_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitQuery>,
) -> ApiResult {
    let db = state.db.lock().await;
    let history = db.chat_history(params.limit.unwrap_or(50).min(500))?;
    Ok(Json(serde_json::to_value(history).map_err(|e| ApiError::internal(e.into()))?))
}

// ---------------------------------------------------------------------------
// Analytics & introspection
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct AnalyticsQuery {
    pub range: Option<String>,
}

pub async fn analytics(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AnalyticsQuery>,
) -> ApiResult {
    let (window, bucket) = match params.range.as_deref().unwrap_or("24h") {
        "1h" => (Duration::hours(1), Duration::minutes(5)),
        "24h" => (Duration::hours(24), Duration::hours(1)),
        "7d" => (Duration::days(7), Duration::hours(6)),
        "30d" => (Duration::days(30), Duration::days(1)),
        other => {
            return Err(ApiError::bad_request(format!(
                "Unknown range '{other}' (use 1h, 24h, 7d, 30d)"
            )))
        }
    };
    let buckets = state.blob.bucketed(window, bucket)?;
    Ok(Json(serde_json::to_value(buckets).map_err(|e| ApiError::internal(e.into()))?))
}

/// Rule 6: the full tool set is always visible.
pub async fn tools(State(state): State<Arc<AppState>>) -> ApiResult {
    let specs = state.registry.specs();
    Ok(Json(serde_json::to_value(specs).map_err(|e| ApiError::internal(e.into()))?))
}
