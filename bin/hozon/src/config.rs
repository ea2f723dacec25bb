use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub download_dir: Option<PathBuf>,
    pub enabled: Option<bool>,
    /// Total attempts of every request
    pub retries: Option<u32>,
    /// Delay before the first retry, in milliseconds
    pub backoff_ms: Option<u64>,
    pub user_agent: Option<String>,
}

impl Config {
    pub fn load(file: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(file)?;
        let config = toml::from_str(&data)?;
        Ok(config)
    }
}
