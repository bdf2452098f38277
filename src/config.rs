use std::path::PathBuf;

use anyhow::{Context, Result};
use logharbor_types::HubConfig;
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = ".logharbor";

/// On-disk configuration for the gateway binary: which cluster to talk to,
/// an optional shared-cache URL, and the streaming fabric's tunables.
/// Mirrors kubescope's `.kubescope` file and `Config::load`/`Config::save`
/// pair, widened to this schema.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub context: Option<String>,
    pub shared_cache_url: Option<String>,
    pub cluster_name: Option<String>,
    #[serde(flatten)]
    pub hub: HubConfig,
}

impl GatewayConfig {
    pub fn load() -> Option<Self> {
        let path = PathBuf::from(CONFIG_FILE_NAME);
        let content = std::fs::read_to_string(&path).ok()?;
        toml::from_str(&content).ok()
    }

    pub fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(CONFIG_FILE_NAME, content)?;
        Ok(())
    }
}

pub fn write_default() -> Result<()> {
    GatewayConfig::default().save().context("writing default configuration")
}
