pub mod types;

use anyhow::{Context, Result};
use std::path::Path;

pub use types::{AppConfig, EngineSettings, LogConfig, ServerDescriptor, ServerType, TunSettings};

pub fn load_config(path: &str) -> Result<AppConfig> {
    let content = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read config file {}", path))?;
    let config = parse_config(&content)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig = serde_yml::from_str(content).context("failed to parse config")?;
    Ok(config)
}
