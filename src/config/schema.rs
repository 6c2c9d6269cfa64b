//! Configuration schema for vigil.toml (TOML-based, env-overridable).

use crate::types::Tier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A provider/model pair inside a tier ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

/// Static description of one LLM provider account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider name, unique across the config.
    pub name: String,

    /// Cost class: "paid", "free", or "unknown".
    pub tier: String,

    /// Billing currency: USD, EUR, GBP, credits, or requests.
    pub currency: String,

    /// Environment variable holding the API key. Empty means no credential
    /// is needed (local providers).
    pub api_key_env: String,

    /// Base URL of the OpenAI-compatible chat completions endpoint.
    pub base_url: String,

    /// Prices per 1K tokens in the provider currency.
    pub input_per_1k: f64,
    pub output_per_1k: f64,

    /// Last balance reported by the creator, if known.
    pub known_balance: Option<f64>,

    pub notes: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            tier: "unknown".into(),
            currency: "USD".into(),
            api_key_env: String::new(),
            base_url: String::new(),
            input_per_1k: 0.0,
            output_per_1k: 0.0,
            known_balance: None,
            notes: None,
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    /// Human-readable agent name.
    pub name: String,

    /// Data directory holding state.db, blob/, vector/, code/.
    pub data_dir: String,

    /// Address for the dashboard API + WebSocket.
    pub listen_addr: String,

    /// Directive seeded on first boot; replaceable at runtime.
    pub initial_directive: String,

    /// Hard monthly spend cap across monetary providers (USD).
    pub monthly_cap_usd: f64,

    /// Sleep clamps for the adaptive pacing, seconds.
    pub min_sleep_seconds: f64,
    pub max_sleep_seconds: f64,
    pub default_sleep_seconds: f64,

    /// Maximum chat messages drained per iteration.
    pub chat_batch_limit: usize,

    /// Timeouts, seconds.
    pub llm_timeout_seconds: u64,
    pub tool_timeout_seconds: u64,

    /// Creator bearer token; `None` disables auth entirely.
    pub creator_token: Option<String>,

    /// Telegram listener (disabled unless both are set).
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_poll_seconds: u64,

    /// Mail gateway inbox endpoint (disabled unless set).
    pub mail_gateway_url: Option<String>,
    pub mail_poll_seconds: u64,

    /// Optional command run by the boot protocol to validate updated source
    /// (e.g. "cargo check"). Structural checks always run.
    pub validate_command: Option<String>,

    /// Remote repository for pushing accepted self-updates.
    pub remote_repo_url: Option<String>,
    pub remote_repo_token: Option<String>,

    /// Provider accounts.
    pub providers: Vec<ProviderConfig>,

    /// Tier ladders: ordered provider/model candidates per tier.
    pub tiers: BTreeMap<Tier, Vec<ModelRef>>,

    /// Log level (debug, info, warn, error).
    pub log_level: String,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            name: "vigil".into(),
            data_dir: "~/.vigil".into(),
            listen_addr: "0.0.0.0:8420".into(),
            initial_directive: DEFAULT_DIRECTIVE.trim().into(),
            monthly_cap_usd: 100.0,
            min_sleep_seconds: 10.0,
            max_sleep_seconds: 3600.0,
            default_sleep_seconds: 30.0,
            chat_batch_limit: 16,
            llm_timeout_seconds: 120,
            tool_timeout_seconds: 30,
            creator_token: None,
            telegram_bot_token: None,
            telegram_chat_id: None,
            telegram_poll_seconds: 3,
            mail_gateway_url: None,
            mail_poll_seconds: 300,
            validate_command: None,
            remote_repo_url: None,
            remote_repo_token: None,
            providers: default_providers(),
            tiers: default_tiers(),
            log_level: "info".into(),
        }
    }
}

const DEFAULT_DIRECTIVE: &str = r#"
Improve yourself: optimize your own code, memory, and capabilities.
Care about your creator and communicate meaningfully. Explore the world
through your tools, and look for honest ways to generate value. Always be
transparent about what you are doing and why.
"#;

impl VigilConfig {
    /// Resolve a path that may contain `~` to an absolute path.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).into_owned())
    }

    /// Resolved data directory.
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.resolve_path(&self.data_dir)
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.resolved_data_dir().join("state.db")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.resolved_data_dir().join("blob")
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.resolved_data_dir().join("vector")
    }

    pub fn code_dir(&self) -> PathBuf {
        self.resolved_data_dir().join("code")
    }

    /// Overlay deploy-time environment variables onto the loaded file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VIGIL_DATA_DIR") {
            self.data_dir = v;
        }
        if let Ok(v) = std::env::var("VIGIL_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Ok(v) = std::env::var("VIGIL_MONTHLY_CAP_USD") {
            if let Ok(cap) = v.parse::<f64>() {
                self.monthly_cap_usd = cap;
            }
        }
        if let Ok(v) = std::env::var("VIGIL_CREATOR_TOKEN") {
            self.creator_token = Some(v);
        }
        if let Ok(v) = std::env::var("TELEGRAM_BOT_TOKEN") {
            self.telegram_bot_token = Some(v);
        }
        if let Ok(v) = std::env::var("TELEGRAM_CHAT_ID") {
            self.telegram_chat_id = Some(v);
        }
        if let Ok(v) = std::env::var("VIGIL_MAIL_GATEWAY_URL") {
            self.mail_gateway_url = Some(v);
        }
        if let Ok(v) = std::env::var("VIGIL_REMOTE_REPO_URL") {
            self.remote_repo_url = Some(v);
        }
        if let Ok(v) = std::env::var("VIGIL_REMOTE_REPO_TOKEN") {
            self.remote_repo_token = Some(v);
        }
        if let Ok(v) = std::env::var("VIGIL_LOG_LEVEL") {
            self.log_level = v;
        }
    }
}

/// Built-in provider accounts. Keys come from the environment at runtime;
/// a provider with no key in the environment is simply unavailable.
fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "anthropic".into(),
            tier: "paid".into(),
            currency: "USD".into(),
            api_key_env: "ANTHROPIC_API_KEY".into(),
            base_url: "https://api.anthropic.com/v1".into(),
            input_per_1k: 0.003,
            output_per_1k: 0.015,
            ..Default::default()
        },
        ProviderConfig {
            name: "openai".into(),
            tier: "paid".into(),
            currency: "USD".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            base_url: "https://api.openai.com/v1".into(),
            input_per_1k: 0.0025,
            output_per_1k: 0.01,
            ..Default::default()
        },
        ProviderConfig {
            name: "mistral".into(),
            tier: "free".into(),
            currency: "requests".into(),
            api_key_env: "MISTRAL_API_KEY".into(),
            base_url: "https://api.mistral.ai/v1".into(),
            input_per_1k: 0.0,
            output_per_1k: 0.0,
            ..Default::default()
        },
        ProviderConfig {
            name: "local".into(),
            tier: "free".into(),
            currency: "requests".into(),
            api_key_env: String::new(),
            base_url: String::new(),
            input_per_1k: 0.0,
            output_per_1k: 0.0,
            ..Default::default()
        },
    ]
}

/// Default tier ladders. Free candidates appear in every ladder so the agent
/// stays reachable when paid budget is exhausted.
fn default_tiers() -> BTreeMap<Tier, Vec<ModelRef>> {
    let m = |provider: &str, model: &str| ModelRef {
        provider: provider.into(),
        model: model.into(),
    };
    BTreeMap::from([
        (
            Tier::Level1,
            vec![
                m("anthropic", "claude-opus-4-6"),
                m("openai", "gpt-5.2"),
                m("mistral", "mistral-large-latest"),
            ],
        ),
        (
            Tier::Level2,
            vec![
                m("anthropic", "claude-sonnet-4-5"),
                m("openai", "gpt-4o"),
                m("mistral", "mistral-large-latest"),
            ],
        ),
        (
            Tier::Level3,
            vec![
                m("mistral", "mistral-small-latest"),
                m("openai", "gpt-4o-mini"),
            ],
        ),
        (
            Tier::CodingLevel1,
            vec![
                m("mistral", "devstral-medium-latest"),
                m("anthropic", "claude-opus-4-6"),
            ],
        ),
        (
            Tier::CodingLevel2,
            vec![
                m("mistral", "devstral-small-latest"),
                m("anthropic", "claude-sonnet-4-5"),
            ],
        ),
        (
            Tier::CodingLevel3,
            vec![
                m("mistral", "devstral-small-latest"),
                m("mistral", "mistral-small-latest"),
            ],
        ),
        (Tier::LocalOnly, vec![m("local", "offline-fallback")]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_local_only_ladder() {
        let cfg = VigilConfig::default();
        let local = cfg.tiers.get(&Tier::LocalOnly).unwrap();
        assert_eq!(local[0].provider, "local");
        assert!(cfg.providers.iter().any(|p| p.name == "local"));
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let cfg = VigilConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: VigilConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.monthly_cap_usd, cfg.monthly_cap_usd);
        assert_eq!(back.tiers.len(), cfg.tiers.len());
    }

    #[test]
    fn data_paths_hang_off_data_dir() {
        let mut cfg = VigilConfig::default();
        cfg.data_dir = "/tmp/vigil-test".into();
        assert_eq!(cfg.state_db_path(), PathBuf::from("/tmp/vigil-test/state.db"));
        assert_eq!(cfg.blob_dir(), PathBuf::from("/tmp/vigil-test/blob"));
    }
}
