//! Wires every component into a running agent.
//!
//! `build` constructs the object graph (fatal only on state-store I/O);
//! `spawn` starts the director, the listeners, the API server, and the
//! self-update health task.

use crate::api::AppState;
use crate::budget::{BudgetTracker, Currency, ProviderRecord, ProviderTier};
use crate::config::{ModelRef, VigilConfig};
use crate::core::{ChatSender, CoreLoop, CHAT_QUEUE_CAPACITY};
use crate::exec::Executor;
use crate::listeners::{MailboxListener, TelegramListener, TelegramSender};
use crate::llm::{HttpProvider, LlmRouter, LocalProvider, Provider};
use crate::memory::{BlobStore, NotePad, VectorStore};
use crate::planner::Planner;
use crate::safety::{SafetyRules, SafetyValidator};
use crate::selfupdate::SelfUpdater;
use crate::state::Database;
use crate::tools::{builtin, ToolRegistry};
use crate::types::Tier;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Liveness window before a booted version is considered healthy.
const HEALTH_DELAY: Duration = Duration::from_secs(30);

pub struct Runtime {
    pub state: Arc<AppState>,
    pub updater: Arc<SelfUpdater>,
    pub cancel: CancellationToken,
    core_loop: Option<CoreLoop>,
    telegram_listener: Option<TelegramListener>,
    mailbox_listener: Option<MailboxListener>,
}

impl Runtime {
    /// Construct the full object graph. Only state-store I/O is fatal here.
    pub async fn build(config: VigilConfig, cancel: CancellationToken) -> Result<Runtime> {
        let data_dir = config.resolved_data_dir();
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // State store: the one fatal dependency.
        let db = Database::open(&config.state_db_path()).context("Failed to open state store")?;
        db.load_or_init_state(&config.initial_directive)?;
        let db = Arc::new(Mutex::new(db));

        let blob = BlobStore::new(config.blob_dir())?;
        let vector = Arc::new(Mutex::new(VectorStore::open(&config.vector_dir())?));
        let notes = NotePad::new(db.clone());

        // Budget: seed provider rows from config.
        let budget = BudgetTracker::new(db.clone(), config.monthly_cap_usd);
        let records: Vec<ProviderRecord> = config
            .providers
            .iter()
            .map(provider_record_from_config)
            .collect();
        budget.ensure_seeded(&records).await?;

        // Providers: one HTTP client per hosted vendor, plus the offline
        // fallback, which is always present.
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        for provider in &config.providers {
            if provider.base_url.is_empty() {
                continue;
            }
            providers.insert(
                provider.name.clone(),
                Arc::new(HttpProvider::new(
                    &provider.name,
                    &provider.base_url,
                    &provider.api_key_env,
                    Duration::from_secs(config.llm_timeout_seconds),
                )),
            );
        }
        providers.insert("local".into(), Arc::new(LocalProvider));

        let mut tiers = config.tiers.clone();
        tiers.entry(Tier::LocalOnly).or_insert_with(|| {
            vec![ModelRef {
                provider: "local".into(),
                model: "offline-fallback".into(),
            }]
        });

        let router = Arc::new(LlmRouter::new(
            providers,
            tiers,
            budget.clone(),
            blob.clone(),
            cancel.clone(),
            Duration::from_secs(config.llm_timeout_seconds),
        ));

        let rules = SafetyRules::global();
        let validator = Arc::new(SafetyValidator::new(rules));
        let planner = Arc::new(Planner::new(router.clone(), vector.clone(), rules));

        // Self-update: live root is this process's source tree.
        let live_root = std::env::var("VIGIL_LIVE_ROOT")
            .map(std::path::PathBuf::from)
            .or_else(|_| std::env::current_dir())
            .context("Cannot resolve live code root")?;
        let updater = Arc::new(
            SelfUpdater::new(live_root, config.code_dir(), config.validate_command.clone())
                .with_remote(
                    config.remote_repo_url.clone(),
                    config.remote_repo_token.clone(),
                ),
        );

        // Tools: append-only registry of the builtin set.
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(builtin::NoteTool {
            pad: notes.clone(),
            db: db.clone(),
        }))?;
        registry.register(Arc::new(builtin::MemoryWriteTool {
            vector: vector.clone(),
        }))?;
        registry.register(Arc::new(builtin::MemorySearchTool {
            vector: vector.clone(),
        }))?;
        registry.register(Arc::new(builtin::BudgetQueryTool {
            budget: budget.clone(),
        }))?;
        registry.register(Arc::new(builtin::HttpRequestTool::new()))?;
        registry.register(Arc::new(builtin::CodingAgentTool {
            router: router.clone(),
        }))?;
        registry.register(Arc::new(builtin::SelfUpdateTool {
            updater: updater.clone(),
            validator: validator.clone(),
        }))?;
        if let (Some(token), Some(chat_id)) =
            (&config.telegram_bot_token, &config.telegram_chat_id)
        {
            registry.register(Arc::new(builtin::SendTelegramTool {
                bot_token: token.clone(),
                chat_id: chat_id.clone(),
                client: reqwest::Client::new(),
            }))?;
        }
        let registry = Arc::new(registry);

        let executor = Arc::new(Executor::new(
            registry.clone(),
            validator.clone(),
            blob.clone(),
        ));

        // Signals and queues between the director and everyone else.
        let (chat_tx, chat_rx) = mpsc::channel(CHAT_QUEUE_CAPACITY);
        let wake = Arc::new(Notify::new());
        let (broadcast_tx, _) = broadcast::channel(128);
        let next_sleep = Arc::new(RwLock::new(config.default_sleep_seconds));
        let chat = ChatSender::new(db.clone(), blob.clone(), chat_tx, wake.clone());

        let telegram_sender = match (&config.telegram_bot_token, &config.telegram_chat_id) {
            (Some(token), Some(chat_id)) => Some(TelegramSender::new(token, chat_id)),
            _ => None,
        };
        let telegram_listener = match (&config.telegram_bot_token, &config.telegram_chat_id) {
            (Some(token), Some(chat_id)) => Some(TelegramListener::new(
                token,
                chat_id,
                chat.clone(),
                Duration::from_secs(config.telegram_poll_seconds),
            )),
            _ => None,
        };
        let mailbox_listener = config.mail_gateway_url.as_ref().map(|url| {
            MailboxListener::new(
                url,
                chat.clone(),
                db.clone(),
                Duration::from_secs(config.mail_poll_seconds),
            )
        });

        let core_loop = CoreLoop {
            config: config.clone(),
            db: db.clone(),
            planner: planner.clone(),
            executor: executor.clone(),
            budget: budget.clone(),
            blob: blob.clone(),
            vector: vector.clone(),
            notes: notes.clone(),
            chat_rx,
            wake,
            broadcast: broadcast_tx.clone(),
            cancel: cancel.clone(),
            telegram: telegram_sender,
            next_sleep: next_sleep.clone(),
            quiet_iterations: 0,
        };

        let state = Arc::new(AppState {
            working: planner.context_handle(),
            config,
            db,
            budget,
            vector,
            blob,
            notes,
            chat,
            broadcast: broadcast_tx,
            registry,
            next_sleep,
        });

        Ok(Runtime {
            state,
            updater,
            cancel,
            core_loop: Some(core_loop),
            telegram_listener,
            mailbox_listener,
        })
    }

    /// Spawn the director, listeners, API server, and health task.
    pub fn spawn(mut self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(core_loop) = self.core_loop.take() {
            handles.push(tokio::spawn(async move {
                if let Err(err) = core_loop.run().await {
                    error!("Core loop exited with error: {err:#}");
                }
            }));
        }

        let api_state = self.state.clone();
        let api_cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = crate::api::serve(api_state, api_cancel).await {
                error!("API server error: {err:#}");
            }
        }));

        if let Some(listener) = self.telegram_listener.take() {
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                if let Err(err) = listener.run(cancel).await {
                    error!("Telegram listener error: {err:#}");
                }
            }));
        }
        if let Some(listener) = self.mailbox_listener.take() {
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                if let Err(err) = listener.run(cancel).await {
                    error!("Mailbox listener error: {err:#}");
                }
            }));
        }

        // Health task: survive the liveness window, clear the revert flag.
        let updater = self.updater.clone();
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(HEALTH_DELAY) => {
                    if let Err(err) = updater.mark_healthy() {
                        error!("Failed to mark healthy: {err:#}");
                    } else {
                        info!("Liveness window passed; revert flag cleared");
                    }
                }
                _ = cancel.cancelled() => {}
            }
        }));

        handles
    }
}

fn provider_record_from_config(config: &crate::config::ProviderConfig) -> ProviderRecord {
    ProviderRecord {
        name: config.name.clone(),
        tier: config.tier.parse().unwrap_or(ProviderTier::Unknown),
        currency: config.currency.parse().unwrap_or(Currency::Usd),
        known_balance: config.known_balance,
        balance_updated_at: None,
        spent_tracked: 0.0,
        api_key_ref: config.api_key_env.clone(),
        input_per_1k: config.input_per_1k,
        output_per_1k: config.output_per_1k,
        notes: config.notes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Channel;

    /// Config pinned to a temp dir with only the offline provider, so a
    /// full iteration runs without any network.
    fn offline_config(dir: &std::path::Path) -> VigilConfig {
        let mut config = VigilConfig::default();
        config.data_dir = dir.join("data").to_string_lossy().into_owned();
        config.listen_addr = "127.0.0.1:0".into();
        config.providers.retain(|p| p.name == "local");
        config.tiers = std::collections::BTreeMap::from([(
            Tier::LocalOnly,
            vec![ModelRef {
                provider: "local".into(),
                model: "offline-fallback".into(),
            }],
        )]);
        config
    }

    #[tokio::test]
    async fn chat_round_trip_through_one_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mut runtime = Runtime::build(offline_config(dir.path()), cancel.clone())
            .await
            .unwrap();

        let state = runtime.state.clone();
        let core_loop = runtime.core_loop.take().unwrap();
        let loop_handle = tokio::spawn(core_loop.run());

        let receiver = state.chat.enqueue("hi", Channel::Web).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(10), receiver)
            .await
            .expect("no reply within timeout")
            .expect("reply channel dropped");
        assert!(!reply.reply.is_empty());
        assert_eq!(reply.provider, "local");

        // History holds the creator message and then an agent reply.
        let history = {
            let db = state.db.lock().await;
            db.chat_history(10).unwrap()
        };
        assert!(history.len() >= 2);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[0].role.to_string(), "creator");
        assert!(history.iter().any(|m| m.role.to_string() == "agent"));

        // Blob carries matching chat events.
        let events = state.blob.read_recent(100).unwrap();
        let types: Vec<String> = events.iter().map(|e| e.event_type.to_string()).collect();
        assert!(types.contains(&"chat_creator".to_string()));
        assert!(types.contains(&"chat_agent".to_string()));

        // Iteration advanced.
        let snapshot = {
            let db = state.db.lock().await;
            db.snapshot().unwrap()
        };
        assert!(snapshot.iteration >= 1);

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), loop_handle).await;
    }

    #[tokio::test]
    async fn pause_halts_iterations_and_wake_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mut runtime = Runtime::build(offline_config(dir.path()), cancel.clone())
            .await
            .unwrap();
        let state = runtime.state.clone();

        {
            let db = state.db.lock().await;
            db.set_paused(true).unwrap();
        }

        let core_loop = runtime.core_loop.take().unwrap();
        let loop_handle = tokio::spawn(core_loop.run());
        tokio::time::sleep(Duration::from_millis(300)).await;

        let before = {
            let db = state.db.lock().await;
            db.snapshot().unwrap().iteration
        };
        assert_eq!(before, 0);

        {
            let db = state.db.lock().await;
            db.set_paused(false).unwrap();
        }
        state.chat.wake();

        // The loop leaves its pause nap and runs an iteration.
        let mut advanced = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let n = {
                let db = state.db.lock().await;
                db.snapshot().unwrap().iteration
            };
            if n >= 1 {
                advanced = true;
                break;
            }
        }
        assert!(advanced, "loop did not resume after unpause");

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), loop_handle).await;
    }
}
