use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kodi_repo_sync_core::config::SyncConfig;
use tracing::{error, info};

/// Overrides `repo_dir` from the config file when set.
pub const REPO_DIR_ENV: &str = "KODI_REPO_SYNC_REPO_DIR";

/// Loads the YAML (or JSON) sync config, applies the `repo_dir` environment
/// override and validates the result.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SyncConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let mut config: SyncConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    if let Ok(repo_dir) = std::env::var(REPO_DIR_ENV) {
        if !repo_dir.trim().is_empty() {
            info!(repo_dir = %repo_dir, "Repository directory overridden from {}", REPO_DIR_ENV);
            config.repo_dir = PathBuf::from(repo_dir);
        }
    }

    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path_ref.display()))?;
    config.trace_loaded();
    Ok(config)
}
