//! Filesystem helpers for the config layer

use std::path::Path;

use anyhow::{Context, Result};
use log::debug;
use tokio::fs;

/// Creates the config directory and any missing parents, an existing one is left untouched
pub async fn create_config_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("cannot create config directory {}", dir.display()))?;
    debug!("Config directory {} is in place", dir.display());
    Ok(())
}
