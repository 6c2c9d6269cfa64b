pub mod schema;

pub use schema::{ModelRef, ProviderConfig, VigilConfig};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Default vigil home directory (~/.vigil).
pub fn default_home_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".vigil"))
        .unwrap_or_else(|| PathBuf::from(".vigil"))
}

/// Load config from the given path (or defaults when absent), then apply
/// environment overrides so credentials never need to live in the file.
pub fn load_config(path: &Path) -> Result<VigilConfig> {
    let mut config = if path.exists() {
        let contents =
            std::fs::read_to_string(path).context("Failed to read vigil config file")?;
        toml::from_str(&contents).context("Failed to parse vigil config (TOML)")?
    } else {
        VigilConfig::default()
    };
    config.apply_env_overrides();
    Ok(config)
}

/// Save config to the given path (TOML format).
pub fn save_config(config: &VigilConfig, path: &Path) -> Result<()> {
    let contents = toml::to_string_pretty(config).context("Failed to serialize config")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents).context("Failed to write config file")?;
    Ok(())
}
