use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use data_contracts::TrainingConfig;

pub const DEFAULT_CONFIG_NAME: &str = "tileseg.toml";
pub const CONFIG_ENV: &str = "TILESEG_CONFIG";

/// Config path from the command line, else `TILESEG_CONFIG`, else `tileseg.toml`.
pub fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    resolve_with_env(cli, std::env::var(CONFIG_ENV).ok())
}

pub fn resolve_with_env(cli: Option<&Path>, env: Option<String>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    env.filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_NAME))
}

pub fn load_training_config(cli: Option<&Path>) -> Result<(PathBuf, TrainingConfig)> {
    let path = resolve_config_path(cli);
    let cfg = TrainingConfig::load(&path)
        .with_context(|| format!("load training config {}", path.display()))?;
    tracing::debug!(path = %path.display(), root = %cfg.dataset.path.display(), "config loaded");
    Ok((path, cfg))
}
